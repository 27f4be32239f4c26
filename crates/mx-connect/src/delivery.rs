use crate::error::ConnectError;
use crate::hook::{ConnectErrorHook, ConnectHook, ConnectPlan, Logger};
use dane::TlsaRecord;
use dns_resolver::{DnsError, HickoryResolver, Resolver};
use futures::future::BoxFuture;
use mta_sts::policy::PolicyMatch;
use mta_sts::{Get, MtaStsPolicy, PolicyCache};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::net::TcpStream;

static DEFAULT_RESOLVER: LazyLock<Arc<dyn Resolver>> = LazyLock::new(|| {
    Arc::new(HickoryResolver::new().expect("Parsing /etc/resolv.conf failed"))
});

/// Resolves the TLSA RRset for an `_<port>._tcp.<exchange>` name.
/// Plugged by callers that want DNSSEC assurance from a dedicated
/// validating resolver.
pub type TlsaResolver =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<TlsaRecord>, DnsError>> + Send + Sync>;

/// One named mail host for the target domain, either resolved from an
/// MX record (`mx=true`) or synthesized from address records or caller
/// hints.
#[derive(Clone, Debug, Default)]
pub struct MxEntry {
    pub exchange: String,
    pub priority: u16,
    pub mx: bool,
    pub a: Vec<Ipv4Addr>,
    pub aaaa: Vec<Ipv6Addr>,
    pub policy_match: Option<PolicyMatch>,
    pub tlsa_records: Option<Vec<TlsaRecord>>,
    pub dane_lookup_failed: bool,
    pub dane_lookup_error: Option<ConnectError>,
}

impl MxEntry {
    pub fn new(exchange: impl Into<String>, priority: u16) -> Self {
        Self {
            exchange: exchange.into(),
            priority,
            ..Default::default()
        }
    }

    pub fn has_addresses(&self) -> bool {
        !self.a.is_empty() || !self.aaaa.is_empty()
    }
}

/// Caller-supplied MX hints come in several shapes: a bare host name,
/// an IP string, or a partial entry. They are all normalized into
/// `MxEntry` before the pipeline runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MxHint {
    Host(String),
    Entry {
        exchange: String,
        #[serde(default)]
        priority: u16,
        #[serde(default)]
        a: Vec<String>,
        #[serde(default)]
        aaaa: Vec<String>,
    },
}

impl MxHint {
    pub(crate) fn normalize(self) -> Result<MxEntry, ConnectError> {
        match self {
            Self::Host(host) => {
                let host = host.trim().to_string();
                let mut entry = MxEntry::new(host.clone(), 0);
                match host.parse::<IpAddr>() {
                    Ok(IpAddr::V4(v4)) => entry.a.push(v4),
                    Ok(IpAddr::V6(v6)) => entry.aaaa.push(v6),
                    Err(_) => {}
                }
                Ok(entry)
            }
            Self::Entry {
                exchange,
                priority,
                a,
                aaaa,
            } => {
                let mut entry = MxEntry::new(exchange.trim().to_string(), priority);
                entry.mx = true;
                for addr in &a {
                    entry.a.push(addr.parse().map_err(|_| {
                        ConnectError::dns("EINVALIDIP", format!("invalid IPv4 address {addr:?}"))
                    })?);
                }
                for addr in &aaaa {
                    entry.aaaa.push(addr.parse().map_err(|_| {
                        ConnectError::dns("EINVALIDIP", format!("invalid IPv6 address {addr:?}"))
                    })?);
                }
                Ok(entry)
            }
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub ignore_ipv6: bool,
    pub prefer_ipv6: bool,
    pub block_local_addresses: bool,
    #[serde(skip)]
    pub resolver: Option<Arc<dyn Resolver>>,
}

impl std::fmt::Debug for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsConfig")
            .field("ignore_ipv6", &self.ignore_ipv6)
            .field("prefer_ipv6", &self.prefer_ipv6)
            .field("block_local_addresses", &self.block_local_addresses)
            .field("resolver", &self.resolver.as_ref().map(|_| "<resolver>"))
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MtaStsConfig {
    pub enabled: bool,
    #[serde(skip)]
    pub cache: Option<Arc<dyn PolicyCache>>,
    #[serde(skip)]
    pub getter: Option<Arc<dyn Get>>,
    #[serde(skip)]
    pub logger: Option<Logger>,
    /// Populated by the fetch stage
    #[serde(skip)]
    pub policy: Option<Arc<MtaStsPolicy>>,
}

impl std::fmt::Debug for MtaStsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtaStsConfig")
            .field("enabled", &self.enabled)
            .field("cache", &self.cache.as_ref().map(|_| "<cache>"))
            .field("getter", &self.getter.as_ref().map(|_| "<getter>"))
            .field("logger", &self.logger.as_ref().map(|_| "<fn>"))
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaneConfig {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(skip)]
    pub resolve_tlsa: Option<TlsaResolver>,
    #[serde(skip)]
    pub logger: Option<Logger>,
}

impl Default for DaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verify: true,
            resolve_tlsa: None,
            logger: None,
        }
    }
}

impl std::fmt::Debug for DaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaneConfig")
            .field("enabled", &self.enabled)
            .field("verify", &self.verify)
            .field(
                "resolve_tlsa",
                &self.resolve_tlsa.as_ref().map(|_| "<fn>"),
            )
            .field("logger", &self.logger.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

fn default_port() -> u16 {
    25
}

fn default_max_connect_time() -> Duration {
    // Per host, matching the RFC 5321 initial-greeting guidance
    Duration::from_secs(5 * 60)
}

/// Everything `connect()` accepts. A bare string target is shorthand
/// for `ConnectOptions { target, ..Default::default() }`; when the
/// target contains `@`, everything up to and including the first `@`
/// is discarded.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub target: String,
    pub port: u16,
    pub mx: Vec<MxHint>,
    pub dns: DnsConfig,
    pub local_address: Option<IpAddr>,
    pub local_address_v4: Option<Ipv4Addr>,
    pub local_address_v6: Option<Ipv6Addr>,
    pub local_hostname: Option<String>,
    pub local_hostname_v4: Option<String>,
    pub local_hostname_v6: Option<String>,
    pub max_connect_time: Duration,
    pub ignore_mx_hosts: Vec<IpAddr>,
    pub mx_last_error: Option<ConnectError>,
    #[serde(skip)]
    pub connect_hook: Option<Arc<dyn ConnectHook>>,
    #[serde(skip)]
    pub connect_error: Option<ConnectErrorHook>,
    pub mta_sts: MtaStsConfig,
    pub dane: DaneConfig,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            target: String::new(),
            port: default_port(),
            mx: vec![],
            dns: DnsConfig::default(),
            local_address: None,
            local_address_v4: None,
            local_address_v6: None,
            local_hostname: None,
            local_hostname_v4: None,
            local_hostname_v6: None,
            max_connect_time: default_max_connect_time(),
            ignore_mx_hosts: vec![],
            mx_last_error: None,
            connect_hook: None,
            connect_error: None,
            mta_sts: MtaStsConfig::default(),
            dane: DaneConfig::default(),
        }
    }
}

impl ConnectOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }
}

impl From<&str> for ConnectOptions {
    fn from(target: &str) -> Self {
        Self::new(target)
    }
}

impl From<String> for ConnectOptions {
    fn from(target: String) -> Self {
        Self::new(target)
    }
}

/// The unit of in-flight state: constructed from the options, mutated
/// by one stage at a time, discarded when `connect()` returns.
pub struct Delivery {
    pub domain: String,
    pub decoded_domain: String,
    pub is_ip: bool,
    pub is_punycode: bool,
    pub port: u16,
    pub mx: Vec<MxEntry>,
    pub dns: DnsConfig,
    pub local_address: Option<IpAddr>,
    pub local_address_v4: Option<Ipv4Addr>,
    pub local_address_v6: Option<Ipv6Addr>,
    pub local_hostname: Option<String>,
    pub local_hostname_v4: Option<String>,
    pub local_hostname_v6: Option<String>,
    pub max_connect_time: Duration,
    pub ignore_mx_hosts: HashSet<IpAddr>,
    /// Used as the final error when the ignore list empties the
    /// candidate set. Its own `temporary` flag is preserved; errors
    /// stored here default to `temporary=true` at construction unless
    /// the producer explicitly said otherwise.
    pub mx_last_error: Option<ConnectError>,
    pub connect_hook: Option<Arc<dyn ConnectHook>>,
    pub connect_error: Option<ConnectErrorHook>,
    pub mta_sts: MtaStsConfig,
    pub dane: DaneConfig,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("domain", &self.domain)
            .field("decoded_domain", &self.decoded_domain)
            .field("is_ip", &self.is_ip)
            .field("is_punycode", &self.is_punycode)
            .field("port", &self.port)
            .field("mx", &self.mx)
            .field("dns", &self.dns)
            .field("local_address", &self.local_address)
            .field("local_address_v4", &self.local_address_v4)
            .field("local_address_v6", &self.local_address_v6)
            .field("local_hostname", &self.local_hostname)
            .field("local_hostname_v4", &self.local_hostname_v4)
            .field("local_hostname_v6", &self.local_hostname_v6)
            .field("max_connect_time", &self.max_connect_time)
            .field("ignore_mx_hosts", &self.ignore_mx_hosts)
            .field("mx_last_error", &self.mx_last_error)
            .field(
                "connect_hook",
                &self.connect_hook.as_ref().map(|_| "<hook>"),
            )
            .field(
                "connect_error",
                &self.connect_error.as_ref().map(|_| "<fn>"),
            )
            .field("mta_sts", &self.mta_sts)
            .field("dane", &self.dane)
            .finish()
    }
}

impl Delivery {
    pub fn new(options: ConnectOptions) -> Result<Self, ConnectError> {
        // An email address as target: keep only the domain part
        let domain = match options.target.split_once('@') {
            Some((_, domain)) => domain.to_string(),
            None => options.target.clone(),
        };

        let mut mx = Vec::with_capacity(options.mx.len());
        for hint in options.mx {
            mx.push(hint.normalize()?);
        }

        Ok(Self {
            domain,
            decoded_domain: String::new(),
            is_ip: false,
            is_punycode: false,
            port: options.port,
            mx,
            dns: options.dns,
            local_address: options.local_address,
            local_address_v4: options.local_address_v4,
            local_address_v6: options.local_address_v6,
            local_hostname: options.local_hostname,
            local_hostname_v4: options.local_hostname_v4,
            local_hostname_v6: options.local_hostname_v6,
            max_connect_time: options.max_connect_time,
            ignore_mx_hosts: options.ignore_mx_hosts.into_iter().collect(),
            mx_last_error: options.mx_last_error,
            connect_hook: options.connect_hook,
            connect_error: options.connect_error,
            mta_sts: options.mta_sts,
            dane: options.dane,
        })
    }

    pub(crate) fn resolver(&self) -> Arc<dyn Resolver> {
        self.dns
            .resolver
            .clone()
            .unwrap_or_else(|| DEFAULT_RESOLVER.clone())
    }

    /// The local address/hostname pair to use for a target of the given
    /// family, substituting the per-family variants when present.
    pub(crate) fn local_binding(&self, ipv6: bool) -> (Option<IpAddr>, Option<String>) {
        let address = if ipv6 {
            self.local_address_v6
                .map(IpAddr::V6)
                .or(match self.local_address {
                    Some(IpAddr::V6(v6)) => Some(IpAddr::V6(v6)),
                    _ => None,
                })
        } else {
            self.local_address_v4
                .map(IpAddr::V4)
                .or(match self.local_address {
                    Some(IpAddr::V4(v4)) => Some(IpAddr::V4(v4)),
                    _ => None,
                })
        };
        let hostname = if ipv6 {
            self.local_hostname_v6
                .clone()
                .or_else(|| self.local_hostname.clone())
        } else {
            self.local_hostname_v4
                .clone()
                .or_else(|| self.local_hostname.clone())
        };
        (address, hostname)
    }

    pub(crate) fn notify_connect_error(&self, err: &ConnectError, plan: &ConnectPlan) {
        tracing::debug!(
            "connection candidate {}[{}]:{} failed: {err}",
            plan.hostname,
            plan.host,
            plan.port
        );
        if let Some(notify) = &self.connect_error {
            notify(err, self, plan);
        }
    }
}

/// The established connection, ready to hand to an SMTP client. When
/// TLSA records are attached, `require_tls` is set: DANE without TLS
/// is a contract violation, and `dane_verifier` carries the
/// authentication context for the STARTTLS upgrade.
#[derive(Debug)]
pub struct Connection {
    pub socket: TcpStream,
    pub hostname: String,
    pub host: IpAddr,
    pub port: u16,
    pub local_address: Option<IpAddr>,
    pub local_hostname: Option<String>,
    pub local_port: Option<u16>,
    pub dane_enabled: bool,
    pub dane_verifier: Option<dane::DaneVerifier>,
    pub tlsa_records: Option<Vec<TlsaRecord>>,
    pub require_tls: bool,
    pub policy_match: Option<PolicyMatch>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_at_sign_stripping() {
        let d = Delivery::new(ConnectOptions::new("user@example.com")).unwrap();
        assert_eq!(d.domain, "example.com");

        // Only up to the first @ is discarded
        let d = Delivery::new(ConnectOptions::new(r#""odd@local"@example.com"#)).unwrap();
        assert_eq!(d.domain, r#"local"@example.com"#);

        let d = Delivery::new(ConnectOptions::new("example.com")).unwrap();
        assert_eq!(d.domain, "example.com");
    }

    #[test]
    fn hint_normalization() {
        let entry = MxHint::Host("mail.example.com".to_string())
            .normalize()
            .unwrap();
        assert_eq!(entry.exchange, "mail.example.com");
        assert!(!entry.mx);
        assert!(!entry.has_addresses());

        let entry = MxHint::Host("192.0.2.1".to_string()).normalize().unwrap();
        assert_eq!(entry.a, vec!["192.0.2.1".parse::<Ipv4Addr>().unwrap()]);

        let entry = MxHint::Entry {
            exchange: "mx.example.com".to_string(),
            priority: 10,
            a: vec!["192.0.2.2".to_string()],
            aaaa: vec!["2001:db8::2".to_string()],
        }
        .normalize()
        .unwrap();
        assert_eq!(entry.priority, 10);
        assert!(entry.has_addresses());

        let err = MxHint::Entry {
            exchange: "mx.example.com".to_string(),
            priority: 0,
            a: vec!["not-an-ip".to_string()],
            aaaa: vec![],
        }
        .normalize()
        .unwrap_err();
        assert_eq!(err.code, "EINVALIDIP");
    }

    #[test]
    fn local_binding_by_family() {
        let mut d = Delivery::new(ConnectOptions::new("example.com")).unwrap();
        d.local_address = Some("198.51.100.1".parse().unwrap());
        d.local_address_v6 = Some("2001:db8::99".parse().unwrap());
        d.local_hostname = Some("sender.example".to_string());
        d.local_hostname_v6 = Some("sender-v6.example".to_string());

        let (addr, host) = d.local_binding(false);
        assert_eq!(addr, Some("198.51.100.1".parse().unwrap()));
        assert_eq!(host.as_deref(), Some("sender.example"));

        let (addr, host) = d.local_binding(true);
        assert_eq!(addr, Some("2001:db8::99".parse().unwrap()));
        assert_eq!(host.as_deref(), Some("sender-v6.example"));

        // A v4-only local address never leaks into a v6 attempt
        d.local_address_v6 = None;
        let (addr, _) = d.local_binding(true);
        assert_eq!(addr, None);
    }
}
