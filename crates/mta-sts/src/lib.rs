use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod dns;
pub mod policy;

pub use dns::{resolve_dns_record, MtaStsDnsRecord};
pub use policy::{
    load_policy_for_domain, Get, HttpsGetter, MtaStsPolicy, PolicyMatch, PolicyMode,
};

/// A policy together with the `_mta-sts` TXT record id it was fetched
/// under; the id decides whether a later fetch can be skipped.
#[derive(Clone)]
pub struct CachedPolicy {
    pub id: String,
    pub policy: Arc<MtaStsPolicy>,
}

/// Storage for fetched policies, keyed by policy domain. The caller
/// owns TTL and eviction; implementations must be safe for concurrent
/// use.
pub trait PolicyCache: Send + Sync {
    fn get(&self, domain: &str) -> Option<CachedPolicy>;
    fn set(&self, domain: &str, policy: CachedPolicy);
}

/// Unbounded in-process cache. Suitable for short-lived processes and
/// tests; long-running senders will want something TTL-aware.
#[derive(Default)]
pub struct MemoryPolicyCache {
    policies: Mutex<HashMap<String, CachedPolicy>>,
}

impl PolicyCache for MemoryPolicyCache {
    fn get(&self, domain: &str) -> Option<CachedPolicy> {
        self.policies.lock().unwrap().get(domain).cloned()
    }

    fn set(&self, domain: &str, policy: CachedPolicy) {
        self.policies
            .lock()
            .unwrap()
            .insert(domain.to_string(), policy);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyStatus {
    /// Fetched for the first time
    Fresh,
    /// The cached copy is still current
    Cached,
    /// The TXT record id changed and the policy was re-fetched
    Renewed,
}

/// Obtain the current policy for `policy_domain`, reusing `cached` when
/// the published record id still matches. Neither removal of the DNS
/// record nor a failing lookup invalidates a cached policy, only
/// publishing a different id does. `Ok(None)` means the domain has no
/// policy at all. Callers should write the result back to their cache
/// whenever the status is not `Cached`.
pub async fn fetch_policy(
    policy_domain: &str,
    cached: Option<CachedPolicy>,
    resolver: &dyn dns_resolver::Resolver,
    getter: &dyn Get,
) -> anyhow::Result<Option<(CachedPolicy, PolicyStatus)>> {
    let record = dns::resolve_dns_record(policy_domain, resolver).await;

    let had_cached = cached.is_some();
    if let Some(cached) = cached {
        let still_valid = match &record {
            Ok(Some(r)) => cached.id == r.id,
            Ok(None) | Err(_) => true,
        };
        if still_valid {
            return Ok(Some((cached, PolicyStatus::Cached)));
        }
    }

    let Some(record) = record? else {
        return Ok(None);
    };

    let policy = Arc::new(policy::load_policy_for_domain(policy_domain, getter).await?);

    Ok(Some((
        CachedPolicy {
            id: record.id,
            policy,
        },
        if had_cached {
            PolicyStatus::Renewed
        } else {
            PolicyStatus::Fresh
        },
    )))
}
