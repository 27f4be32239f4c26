pub use hickory_resolver::proto::rr::rdata::tlsa;
pub use hickory_resolver::proto::rr::rdata::tlsa::TLSA;
pub use hickory_resolver::proto::rr::RecordType;
pub use hickory_resolver::Name;
use std::net::{Ipv4Addr, Ipv6Addr};

mod resolver;
pub use resolver::{
    Answer, DnsError, DnsErrorCode, HickoryResolver, Resolver, TestResolver,
};

pub fn fully_qualify(domain_name: &str) -> Result<Name, DnsError> {
    let mut name = Name::from_str_relaxed(domain_name)
        .map_err(|err| DnsError::InvalidName(format!("invalid name {domain_name}: {err}")))?
        .to_lowercase();

    // Treat it as fully qualified
    name.set_fqdn(true);

    Ok(name)
}

/// One MX answer record. `priority` is the RFC 974 preference value;
/// lower is preferred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

/// Resolve the MX RRset for `domain_name`. An empty or NXDOMAIN answer
/// is reported as a `DnsError` with a recoverable code so that callers
/// can fall back to address records.
pub async fn resolve_mx(
    resolver: &dyn Resolver,
    domain_name: &str,
) -> Result<Vec<MxRecord>, DnsError> {
    let name = fully_qualify(domain_name)?;
    let answer = resolver.resolve(name.clone(), RecordType::MX).await?;

    let mut records = vec![];
    for r in &answer.records {
        if let Some(mx) = r.as_mx() {
            records.push(MxRecord {
                exchange: mx.exchange().to_lowercase().to_ascii(),
                priority: mx.preference(),
            });
        }
    }

    if records.is_empty() {
        return Err(answer.negative_error(&name));
    }

    Ok(records)
}

pub async fn resolve_ipv4(
    resolver: &dyn Resolver,
    domain_name: &str,
) -> Result<Vec<Ipv4Addr>, DnsError> {
    let name = fully_qualify(domain_name)?;
    let answer = resolver.resolve(name.clone(), RecordType::A).await?;

    let addrs: Vec<Ipv4Addr> = answer
        .records
        .iter()
        .filter_map(|r| r.as_a().map(|a| a.0))
        .collect();

    if addrs.is_empty() {
        return Err(answer.negative_error(&name));
    }

    Ok(addrs)
}

pub async fn resolve_ipv6(
    resolver: &dyn Resolver,
    domain_name: &str,
) -> Result<Vec<Ipv6Addr>, DnsError> {
    let name = fully_qualify(domain_name)?;
    let answer = resolver.resolve(name.clone(), RecordType::AAAA).await?;

    let addrs: Vec<Ipv6Addr> = answer
        .records
        .iter()
        .filter_map(|r| r.as_aaaa().map(|a| a.0))
        .collect();

    if addrs.is_empty() {
        return Err(answer.negative_error(&name));
    }

    Ok(addrs)
}

/// Resolves TLSA records for a destination name and port according to
/// <https://datatracker.ietf.org/doc/html/rfc6698#appendix-B.2>.
/// NODATA/NXDOMAIN surfaces as a recoverable error; DNSSEC assurance is
/// the configured resolver's responsibility, but a bogus answer is
/// always refused.
pub async fn resolve_tlsa(
    resolver: &dyn Resolver,
    hostname: &str,
    port: u16,
) -> Result<Vec<TLSA>, DnsError> {
    let name = fully_qualify(&format!("_{port}._tcp.{hostname}"))?;
    let answer = resolver.resolve(name.clone(), RecordType::TLSA).await?;
    tracing::debug!("resolve_tlsa {hostname}:{port} TLSA answer is: {answer:?}");

    if answer.bogus {
        // Bogus records are either tampered with, or due to misconfiguration
        // of the local resolver
        return Err(DnsError::Lookup {
            code: DnsErrorCode::Other,
            message: format!(
                "TLSA result for {hostname}:{port} unusable because: {}",
                answer
                    .why_bogus
                    .as_deref()
                    .unwrap_or("DNSSEC validation failed")
            ),
        });
    }

    let mut result = vec![];
    for r in &answer.records {
        if let Some(tlsa) = r.as_tlsa() {
            result.push(tlsa.clone());
        }
    }

    if result.is_empty() {
        return Err(answer.negative_error(&name));
    }

    // DNS results are unordered. For the sake of deterministic
    // downstream behavior, sort these records. The TLSA type is not
    // Ord, so order by the string form; the cardinality of TLSA
    // records is generally low.
    result.sort_by_key(|a| a.to_string());

    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;

    const ZONE: &str = r#"$ORIGIN example.com.
example.com. 60 IN MX 10 mail.example.com.
example.com. 60 IN MX 20 backup.example.com.
mail.example.com. 60 IN A 192.0.2.1
mail.example.com. 60 IN AAAA 2001:db8::1
"#;

    #[tokio::test]
    async fn mx_lookup() {
        let resolver = TestResolver::default().with_zone(ZONE);
        let mut mx = resolve_mx(&resolver, "example.com").await.unwrap();
        mx.sort_by_key(|r| r.priority);
        k9::snapshot!(
            mx,
            r#"
[
    MxRecord {
        exchange: "mail.example.com.",
        priority: 10,
    },
    MxRecord {
        exchange: "backup.example.com.",
        priority: 20,
    },
]
"#
        );
    }

    #[tokio::test]
    async fn mx_lookup_nodata() {
        let resolver = TestResolver::default().with_zone(ZONE);
        let err = resolve_mx(&resolver, "mail.example.com").await.unwrap_err();
        assert_eq!(err.code(), DnsErrorCode::NoData);
        assert!(err.code().is_recoverable());
    }

    #[tokio::test]
    async fn mx_lookup_nxdomain() {
        let resolver = TestResolver::default().with_zone(ZONE);
        let err = resolve_mx(&resolver, "other.example").await.unwrap_err();
        assert_eq!(err.code(), DnsErrorCode::NotFound);
        assert!(err.code().is_recoverable());
    }

    #[tokio::test]
    async fn address_lookups() {
        let resolver = TestResolver::default().with_zone(ZONE);
        let v4 = resolve_ipv4(&resolver, "mail.example.com").await.unwrap();
        assert_eq!(v4, vec!["192.0.2.1".parse::<Ipv4Addr>().unwrap()]);
        let v6 = resolve_ipv6(&resolver, "mail.example.com").await.unwrap();
        assert_eq!(v6, vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn servfail_is_not_recoverable() {
        let resolver = TestResolver::default()
            .with_zone(ZONE)
            .with_error("example.com", RecordType::MX, DnsErrorCode::ServFail);
        let err = resolve_mx(&resolver, "example.com").await.unwrap_err();
        assert_eq!(err.code(), DnsErrorCode::ServFail);
        assert!(!err.code().is_recoverable());
    }
}
