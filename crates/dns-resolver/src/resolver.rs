use async_trait::async_trait;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::proto::op::response_code::ResponseCode;
use hickory_resolver::proto::rr::rdata::tlsa::TLSA;
use hickory_resolver::proto::rr::rdata::TXT;
use hickory_resolver::proto::rr::{LowerName, RData, RecordSet, RecordType, RrKey};
use hickory_resolver::proto::serialize::txt::Parser;
use hickory_resolver::{Name, TokioResolver};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Short machine token for a DNS failure, in the libc/resolver style
/// that callers can branch on. `NotFound` and `NoData` are the only
/// recoverable codes: they mean the name or record type simply is not
/// published and a caller may fall back to another record type.
/// Everything else indicates the lookup itself failed and should be
/// retried later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsErrorCode {
    /// NXDOMAIN
    NotFound,
    /// The name exists but has no records of the requested type
    NoData,
    ServFail,
    Refused,
    Timeout,
    Other,
}

impl DnsErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "ENOTFOUND",
            Self::NoData => "ENODATA",
            Self::ServFail => "ESERVFAIL",
            Self::Refused => "EREFUSED",
            Self::Timeout => "ETIMEOUT",
            Self::Other => "EDNSFAIL",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound | Self::NoData)
    }
}

impl fmt::Display for DnsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("{message}")]
    Lookup { code: DnsErrorCode, message: String },
}

impl DnsError {
    pub fn code(&self) -> DnsErrorCode {
        match self {
            Self::InvalidName(_) => DnsErrorCode::NotFound,
            Self::Lookup { code, .. } => *code,
        }
    }
}

#[derive(Debug)]
pub struct Answer {
    pub canon_name: Option<String>,
    pub records: Vec<RData>,
    pub nxdomain: bool,
    pub secure: bool,
    pub bogus: bool,
    pub why_bogus: Option<String>,
    pub expires: Instant,
    pub response_code: ResponseCode,
}

impl Answer {
    pub fn as_txt(&self) -> Vec<String> {
        let mut result = vec![];
        for r in &self.records {
            if let Some(txt) = r.as_txt() {
                let mut joined = String::new();
                for t in txt.iter() {
                    joined.push_str(&String::from_utf8_lossy(t));
                }
                result.push(joined);
            }
        }
        result
    }

    /// The error corresponding to an empty answer: NXDOMAIN maps to
    /// `NotFound`, an empty NOERROR answer to `NoData`.
    pub fn negative_error(&self, name: &impl fmt::Display) -> DnsError {
        if self.nxdomain {
            DnsError::Lookup {
                code: DnsErrorCode::NotFound,
                message: format!("{name}: NXDOMAIN"),
            }
        } else {
            DnsError::Lookup {
                code: DnsErrorCode::NoData,
                message: format!("{name}: no records of the requested type"),
            }
        }
    }
}

/// The single operation the pipeline needs from DNS. Callers may plug
/// any implementation; errors must carry a `DnsErrorCode` so that the
/// recoverable/fatal distinction survives the boundary.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError>;

    async fn resolve_txt(&self, name: &str) -> Result<Answer, DnsError> {
        let name = Name::from_utf8(name)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {name}: {err}")))?;
        self.resolve(name, RecordType::TXT).await
    }
}

/// A resolver over a fixed set of records, for tests. Records are
/// declared as zone file text via `with_zone`, or inserted directly.
/// `with_error` forces a lookup failure for one (name, type) pair.
#[derive(Debug, Default)]
pub struct TestResolver {
    records: BTreeMap<Name, BTreeMap<RrKey, RecordSet>>,
    errors: BTreeMap<(Name, RecordType), DnsErrorCode>,
}

impl TestResolver {
    pub fn with_zone(mut self, zone: &str) -> Self {
        let (mut name, records) = Parser::new(zone, None, None).parse().unwrap();
        // The parser can create results with varying FQDN-ness, so let's
        // ensure that they're all marked as FQDN, otherwise our get()
        // function can fail to resolve data from the zone.
        name.set_fqdn(true);
        let fqdn_records = records
            .into_iter()
            .map(|(key, value)| {
                if key.name().is_fqdn() {
                    (key, value)
                } else {
                    let mut name: Name = key.name().into();
                    name.set_fqdn(true);
                    (RrKey::new(LowerName::new(&name), key.record_type), value)
                }
            })
            .collect();
        self.records.insert(name, fqdn_records);
        self
    }

    pub fn with_txt(self, domain: &str, value: String) -> Self {
        let fqdn = format!("{}.", domain);
        let authority = Name::from_str(&fqdn).unwrap();

        let mut records = RecordSet::new(authority.clone(), RecordType::TXT, 0);
        records.add_rdata(RData::TXT(TXT::new(vec![value])));
        self.insert(authority, RecordType::TXT, records)
    }

    pub fn with_tlsa(self, fqdn_label: &str, tlsa: TLSA) -> Self {
        let fqdn = format!("{}.", fqdn_label);
        let authority = Name::from_str(&fqdn).unwrap();

        let mut records = RecordSet::new(authority.clone(), RecordType::TLSA, 0);
        records.add_rdata(RData::TLSA(tlsa));
        self.insert(authority, RecordType::TLSA, records)
    }

    pub fn with_error(mut self, domain: &str, rrtype: RecordType, code: DnsErrorCode) -> Self {
        let fqdn = format!("{}.", domain.trim_end_matches('.'));
        let name = Name::from_str(&fqdn).unwrap();
        self.errors.insert((name, rrtype), code);
        self
    }

    fn insert(mut self, authority: Name, record_type: RecordType, records: RecordSet) -> Self {
        let key = RrKey {
            name: LowerName::new(&authority),
            record_type,
        };
        self.records
            .entry(authority)
            .or_default()
            .insert(key, records);
        self
    }

    fn get(&self, full: &Name, record_type: RecordType) -> Result<Answer, DnsError> {
        let mut full_fqdn = full.clone();
        full_fqdn.set_fqdn(true);

        if let Some(code) = self.errors.get(&(full_fqdn.clone(), record_type)) {
            return Err(DnsError::Lookup {
                code: *code,
                message: format!("failed to query DNS for {full_fqdn}: {code}"),
            });
        }

        let mut authority = full_fqdn.clone();
        let records = loop {
            if let Some(records) = self.records.get(&authority) {
                break records;
            };

            if authority.num_labels() > 1 {
                authority = authority.base_name();
                continue;
            }

            return Ok(Answer {
                canon_name: None,
                records: vec![],
                nxdomain: true,
                secure: false,
                bogus: false,
                why_bogus: None,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NXDomain,
            });
        };

        let records = records.get(&RrKey {
            name: LowerName::from(&full_fqdn),
            record_type,
        });

        let Some(records) = records else {
            return Ok(Answer {
                canon_name: None,
                records: vec![],
                nxdomain: false,
                secure: false,
                bogus: false,
                why_bogus: None,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NoError,
            });
        };

        Ok(Answer {
            canon_name: None,
            records: records
                .records_without_rrsigs()
                .map(|r| r.data().clone())
                .collect(),
            nxdomain: false,
            secure: false,
            bogus: false,
            why_bogus: None,
            expires: Instant::now() + Duration::from_secs(60),
            response_code: ResponseCode::NoError,
        })
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        self.get(&name, rrtype)
    }
}

/// Resolver over the platform configuration (`/etc/resolv.conf`).
pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Result<Self, hickory_resolver::ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
        })
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        match self.inner.lookup(name.clone(), rrtype).await {
            Ok(result) => {
                let expires = result.valid_until();
                let records = result.iter().cloned().collect();
                Ok(Answer {
                    canon_name: None,
                    records,
                    nxdomain: false,
                    secure: false,
                    bogus: false,
                    why_bogus: None,
                    expires,
                    response_code: ResponseCode::NoError,
                })
            }
            Err(err) => match err.proto().map(|err| err.kind()) {
                Some(ProtoErrorKind::NoRecordsFound {
                    negative_ttl,
                    response_code,
                    ..
                }) => match response_code {
                    ResponseCode::ServFail => Err(DnsError::Lookup {
                        code: DnsErrorCode::ServFail,
                        message: format!("failed to query DNS for {name}: SERVFAIL"),
                    }),
                    ResponseCode::Refused => Err(DnsError::Lookup {
                        code: DnsErrorCode::Refused,
                        message: format!("failed to query DNS for {name}: REFUSED"),
                    }),
                    response_code => Ok(Answer {
                        canon_name: None,
                        records: vec![],
                        nxdomain: *response_code == ResponseCode::NXDomain,
                        secure: false,
                        bogus: false,
                        why_bogus: None,
                        response_code: *response_code,
                        expires: Instant::now()
                            + Duration::from_secs(negative_ttl.unwrap_or(60) as u64),
                    }),
                },
                Some(ProtoErrorKind::Timeout) => Err(DnsError::Lookup {
                    code: DnsErrorCode::Timeout,
                    message: format!("failed to query DNS for {name}: timed out"),
                }),
                _ => Err(DnsError::Lookup {
                    code: DnsErrorCode::Other,
                    message: format!("failed to query DNS for {name}: {err}"),
                }),
            },
        }
    }
}

impl From<TokioResolver> for HickoryResolver {
    fn from(inner: TokioResolver) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zone_lookup_and_walk_up() {
        let resolver = TestResolver::default().with_zone(
            r#"$ORIGIN example.com.
example.com. 60 IN A 192.0.2.7
"#,
        );

        let answer = resolver
            .resolve(Name::from_str("example.com.").unwrap(), RecordType::A)
            .await
            .unwrap();
        assert_eq!(answer.records.len(), 1);
        assert!(!answer.nxdomain);

        // Same zone, no AAAA records: NODATA rather than NXDOMAIN
        let answer = resolver
            .resolve(Name::from_str("example.com.").unwrap(), RecordType::AAAA)
            .await
            .unwrap();
        assert!(answer.records.is_empty());
        assert!(!answer.nxdomain);

        // Unknown name below the zone apex walks up and reports NXDOMAIN
        let answer = resolver
            .resolve(Name::from_str("nope.elsewhere.test.").unwrap(), RecordType::A)
            .await
            .unwrap();
        assert!(answer.nxdomain);
    }

    #[tokio::test]
    async fn forced_errors() {
        let resolver = TestResolver::default().with_error(
            "example.com",
            RecordType::MX,
            DnsErrorCode::Refused,
        );
        let err = resolver
            .resolve(Name::from_str("example.com.").unwrap(), RecordType::MX)
            .await
            .unwrap_err();
        assert_eq!(err.code(), DnsErrorCode::Refused);
    }

    #[tokio::test]
    async fn txt_fixture() {
        let resolver = TestResolver::default().with_txt(
            "_mta-sts.example.com",
            "v=STSv1; id=20240101T000000;".to_owned(),
        );
        let answer = resolver.resolve_txt("_mta-sts.example.com.").await.unwrap();
        k9::snapshot!(
            answer.as_txt(),
            r#"
[
    "v=STSv1; id=20240101T000000;",
]
"#
        );
    }
}
