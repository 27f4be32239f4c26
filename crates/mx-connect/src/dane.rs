use crate::delivery::Delivery;
use crate::error::ConnectError;
use crate::hook;
use dane::{tlsa_fqdn, TlsaRecord};
use dns_resolver::{DnsError, Resolver};

/// Resolve TLSA records for every MX entry the caller did not already
/// supply them for. All per-host queries run in parallel. An absent
/// RRset means the host simply has no DANE; a failing lookup taints
/// the host (when verification is on) so that the connection engine
/// refuses it before opening a socket.
pub(crate) async fn run(delivery: &mut Delivery) -> Result<(), ConnectError> {
    let port = delivery.port;
    let resolver = delivery.resolver();
    let custom = delivery.dane.resolve_tlsa.clone();

    let pending: Vec<(usize, String)> = delivery
        .mx
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.tlsa_records.is_none())
        .map(|(idx, entry)| (idx, entry.exchange.clone()))
        .collect();

    let lookups = pending.into_iter().map(|(idx, exchange)| {
        let resolver = resolver.clone();
        let custom = custom.clone();
        async move {
            let result = match custom {
                Some(resolve) => resolve(tlsa_fqdn(&exchange, port)).await,
                None => resolve_records(&*resolver, &exchange, port).await,
            };
            (idx, exchange, result)
        }
    });

    let results = futures::future::join_all(lookups).await;

    for (idx, exchange, result) in results {
        let entry = &mut delivery.mx[idx];
        match result {
            Ok(records) => {
                if !records.is_empty() {
                    hook::emit(
                        &delivery.dane.logger,
                        "dane",
                        true,
                        format!("resolved {} TLSA record(s) for {exchange}", records.len()),
                    );
                }
                entry.tlsa_records = Some(records);
            }
            Err(err) if err.code().is_recoverable() => {
                entry.tlsa_records = Some(vec![]);
            }
            Err(err) => {
                if delivery.dane.verify {
                    hook::emit(
                        &delivery.dane.logger,
                        "dane",
                        false,
                        format!("TLSA lookup for {exchange} failed: {err}"),
                    );
                    entry.dane_lookup_failed = true;
                    entry.dane_lookup_error.replace(ConnectError::dane_lookup(
                        format!("TLSA lookup for {exchange} failed: {err}"),
                    ));
                } else {
                    entry.tlsa_records = Some(vec![]);
                }
            }
        }
    }

    Ok(())
}

async fn resolve_records(
    resolver: &dyn Resolver,
    exchange: &str,
    port: u16,
) -> Result<Vec<TlsaRecord>, DnsError> {
    let answer = dns_resolver::resolve_tlsa(resolver, exchange, port).await?;
    let mut records = vec![];
    for tlsa in &answer {
        match TlsaRecord::try_from(tlsa) {
            Ok(record) => records.push(record),
            Err(err) => {
                // Unknown parameter values are unusable; skip the
                // record rather than the host
                tracing::warn!("skipping TLSA record for {exchange}: {}", err.message);
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delivery::{ConnectOptions, MxEntry};
    use dane::{CertAssociation, CertUsage, Matching, Selector};
    use dns_resolver::{tlsa, DnsErrorCode, RecordType, TestResolver};
    use std::sync::Arc;

    fn delivery(resolver: TestResolver, mx: Vec<MxEntry>) -> Delivery {
        let mut options = ConnectOptions::new("example.com");
        options.dns.resolver = Some(Arc::new(resolver));
        options.dane.enabled = true;
        let mut delivery = Delivery::new(options).unwrap();
        delivery.decoded_domain = "example.com".to_string();
        delivery.mx = mx;
        delivery
    }

    #[tokio::test]
    async fn resolves_records_per_host() {
        let resolver = TestResolver::default().with_tlsa(
            "_25._tcp.mail.example.com",
            tlsa::TLSA::new(
                tlsa::CertUsage::DaneEe,
                tlsa::Selector::Spki,
                tlsa::Matching::Sha256,
                vec![0xab; 32],
            ),
        );
        let mut d = delivery(
            resolver,
            vec![
                MxEntry::new("mail.example.com", 10),
                MxEntry::new("plain.example.com", 20),
            ],
        );
        run(&mut d).await.unwrap();

        let records = d.mx[0].tlsa_records.as_ref().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usage, CertUsage::DaneEe);
        assert_eq!(records[0].selector, Selector::Spki);
        assert_eq!(records[0].matching, Matching::Sha256);
        assert_eq!(
            records[0].association,
            CertAssociation::Bytes(vec![0xab; 32])
        );

        // No TLSA RRset: empty result, not an error
        assert_eq!(d.mx[1].tlsa_records.as_deref(), Some(&[][..]));
        assert!(!d.mx[1].dane_lookup_failed);
    }

    #[tokio::test]
    async fn lookup_failure_taints_host_when_verifying() {
        let resolver = TestResolver::default().with_error(
            "_25._tcp.mail.example.com",
            RecordType::TLSA,
            DnsErrorCode::ServFail,
        );
        let mut d = delivery(resolver, vec![MxEntry::new("mail.example.com", 10)]);
        run(&mut d).await.unwrap();

        assert!(d.mx[0].dane_lookup_failed);
        let err = d.mx[0].dane_lookup_error.as_ref().unwrap();
        assert_eq!(err.category, crate::ErrorCategory::Dane);
        assert!(err.temporary);
        assert!(d.mx[0].tlsa_records.is_none());
    }

    #[tokio::test]
    async fn lookup_failure_ignored_without_verification() {
        let resolver = TestResolver::default().with_error(
            "_25._tcp.mail.example.com",
            RecordType::TLSA,
            DnsErrorCode::ServFail,
        );
        let mut d = delivery(resolver, vec![MxEntry::new("mail.example.com", 10)]);
        d.dane.verify = false;
        run(&mut d).await.unwrap();

        assert!(!d.mx[0].dane_lookup_failed);
        assert_eq!(d.mx[0].tlsa_records.as_deref(), Some(&[][..]));
    }

    #[tokio::test]
    async fn caller_supplied_records_are_kept() {
        let mut entry = MxEntry::new("mail.example.com", 10);
        entry.tlsa_records = Some(vec![dane::TlsaRecord::new(
            CertUsage::DaneEe,
            Selector::Full,
            Matching::Sha256,
            CertAssociation::Hex("00".repeat(32)),
        )]);
        // A resolver that would fail if it were consulted
        let resolver = TestResolver::default().with_error(
            "_25._tcp.mail.example.com",
            RecordType::TLSA,
            DnsErrorCode::ServFail,
        );
        let mut d = delivery(resolver, vec![entry]);
        run(&mut d).await.unwrap();
        assert_eq!(d.mx[0].tlsa_records.as_ref().unwrap().len(), 1);
        assert!(!d.mx[0].dane_lookup_failed);
    }

    #[tokio::test]
    async fn custom_tlsa_resolver_is_used() {
        let mut d = delivery(TestResolver::default(), vec![MxEntry::new("mail.example.com", 10)]);
        d.dane.resolve_tlsa = Some(Arc::new(|fqdn: String| {
            Box::pin(async move {
                assert_eq!(fqdn, "_25._tcp.mail.example.com");
                Ok(vec![dane::TlsaRecord::new(
                    CertUsage::DaneEe,
                    Selector::Spki,
                    Matching::Sha256,
                    CertAssociation::Hex("11".repeat(32)),
                )])
            })
        }));
        run(&mut d).await.unwrap();
        assert_eq!(d.mx[0].tlsa_records.as_ref().unwrap().len(), 1);
    }
}
