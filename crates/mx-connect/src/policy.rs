use crate::delivery::Delivery;
use crate::error::ConnectError;
use crate::hook;
use mta_sts::{HttpsGetter, PolicyStatus};
use std::sync::Arc;

/// Obtain the MTA-STS policy for the target domain, consulting and
/// maintaining the configured cache. A domain without a policy is the
/// normal case; only a failure to *determine* the policy is fatal.
pub(crate) async fn fetch(delivery: &mut Delivery) -> Result<(), ConnectError> {
    if delivery.is_ip {
        // Address literals have no policy domain
        return Ok(());
    }

    let domain = delivery.decoded_domain.clone();
    let cached = delivery
        .mta_sts
        .cache
        .as_ref()
        .and_then(|cache| cache.get(&domain));
    let resolver = delivery.resolver();
    let getter = delivery
        .mta_sts
        .getter
        .clone()
        .unwrap_or_else(|| Arc::new(HttpsGetter));

    match mta_sts::fetch_policy(&domain, cached, &*resolver, &*getter).await {
        Ok(Some((policy, status))) => {
            hook::emit(
                &delivery.mta_sts.logger,
                "mta-sts",
                true,
                format!(
                    "resolved MTA-STS policy for {domain}: mode={} ({status:?})",
                    policy.policy.mode
                ),
            );
            if status != PolicyStatus::Cached {
                if let Some(cache) = &delivery.mta_sts.cache {
                    cache.set(&domain, policy.clone());
                }
            }
            delivery.mta_sts.policy = Some(policy.policy);
            Ok(())
        }
        Ok(None) => {
            hook::emit(
                &delivery.mta_sts.logger,
                "mta-sts",
                true,
                format!("no MTA-STS policy published for {domain}"),
            );
            Ok(())
        }
        Err(err) => {
            let err = ConnectError::policy_fetch(err);
            hook::emit(
                &delivery.mta_sts.logger,
                "mta-sts",
                false,
                err.message.clone(),
            );
            Err(err)
        }
    }
}

/// Mark every MX entry with its verdict against the policy. Nothing is
/// dropped here; the connection engine enforces.
pub(crate) fn validate(delivery: &mut Delivery) {
    let Some(policy) = delivery.mta_sts.policy.clone() else {
        return;
    };

    for entry in &mut delivery.mx {
        let verdict = policy.evaluate_host(&entry.exchange);
        if !verdict.valid {
            hook::emit(
                &delivery.mta_sts.logger,
                "mta-sts",
                false,
                format!(
                    "MX {} does not match the MTA-STS policy for {} (mode={})",
                    entry.exchange, delivery.decoded_domain, verdict.mode
                ),
            );
        }
        entry.policy_match = Some(verdict);
    }
}
