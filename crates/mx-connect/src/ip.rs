use crate::delivery::Delivery;
use crate::error::ConnectError;
use crate::validate;
use dns_resolver::DnsError;
use std::net::IpAddr;

/// Expand every MX entry that lacks addresses into its A/AAAA records.
/// All lookups run in parallel; per-host failures are captured in-band
/// so that one broken exchange never sinks the others. Only when no
/// entry ends up with a usable address does the captured error (or a
/// synthetic ENOTFOUND) fail the pipeline.
pub(crate) async fn run(delivery: &mut Delivery) -> Result<(), ConnectError> {
    let resolver = delivery.resolver();
    let ignore_ipv6 = delivery.dns.ignore_ipv6;

    let pending: Vec<(usize, String)> = delivery
        .mx
        .iter()
        .enumerate()
        .filter(|(_, entry)| !entry.has_addresses())
        .map(|(idx, entry)| (idx, entry.exchange.clone()))
        .collect();

    let lookups = pending.into_iter().map(|(idx, exchange)| {
        let resolver = resolver.clone();
        async move {
            // An exchange that is itself an address needs no lookup
            if let Ok(ip) = exchange.parse::<IpAddr>() {
                return match ip {
                    IpAddr::V4(v4) => (idx, Ok(vec![v4]), Ok(vec![])),
                    IpAddr::V6(v6) => (idx, Ok(vec![]), Ok(vec![v6])),
                };
            }

            let (a, aaaa) = tokio::join!(
                dns_resolver::resolve_ipv4(&*resolver, &exchange),
                async {
                    if ignore_ipv6 {
                        Ok(vec![])
                    } else {
                        soften(dns_resolver::resolve_ipv6(&*resolver, &exchange).await)
                    }
                }
            );
            (idx, soften(a), aaaa)
        }
    });

    let results = futures::future::join_all(lookups).await;

    let mut first_error: Option<ConnectError> = None;
    let mut capture = |err: ConnectError| {
        if first_error.is_none() {
            first_error.replace(err);
        }
    };

    for (idx, a, aaaa) in results {
        let entry = &mut delivery.mx[idx];
        match a {
            Ok(addrs) => entry.a = addrs,
            Err(err) => capture(ConnectError::from_dns(&err)),
        }
        match aaaa {
            Ok(addrs) => entry.aaaa = addrs,
            Err(err) => capture(ConnectError::from_dns(&err)),
        }
    }

    // Filter pass over every entry, including ones the caller supplied
    // with addresses attached
    let block_local = delivery.dns.block_local_addresses;
    let mut address_found = false;
    for entry in &mut delivery.mx {
        if ignore_ipv6 {
            entry.aaaa.clear();
        }
        filter_family(&mut entry.a, block_local, &mut capture, IpAddr::V4);
        filter_family(&mut entry.aaaa, block_local, &mut capture, IpAddr::V6);
        if entry.has_addresses() {
            address_found = true;
        }
    }

    if !address_found {
        return Err(first_error.unwrap_or_else(|| {
            ConnectError::dns(
                "ENOTFOUND",
                format!(
                    "no usable addresses found for the MX hosts of {}",
                    delivery.decoded_domain
                ),
            )
        }));
    }

    Ok(())
}

/// NODATA/NXDOMAIN is an empty list rather than an error
fn soften<T>(result: Result<Vec<T>, DnsError>) -> Result<Vec<T>, DnsError> {
    match result {
        Err(err) if err.code().is_recoverable() => Ok(vec![]),
        other => other,
    }
}

fn filter_family<T: Copy>(
    addrs: &mut Vec<T>,
    block_local: bool,
    capture: &mut impl FnMut(ConnectError),
    wrap: impl Fn(T) -> IpAddr,
) {
    addrs.retain(|addr| match validate::invalid_reason(&wrap(*addr), block_local) {
        Some(reason) => {
            capture(ConnectError::dns("EINVALIDIP", reason));
            false
        }
        None => true,
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delivery::{ConnectOptions, MxEntry};
    use dns_resolver::{DnsErrorCode, RecordType, TestResolver};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    fn delivery_with(resolver: TestResolver, mx: Vec<MxEntry>) -> Delivery {
        let mut options = ConnectOptions::new("example.com");
        options.dns.resolver = Some(Arc::new(resolver));
        let mut delivery = Delivery::new(options).unwrap();
        delivery.decoded_domain = "example.com".to_string();
        delivery.mx = mx;
        delivery
    }

    #[tokio::test]
    async fn expands_all_entries_in_parallel() {
        let resolver = TestResolver::default().with_zone(
            r#"$ORIGIN example.com.
primary.example.com. 60 IN A 192.0.2.1
primary.example.com. 60 IN AAAA 2001:db8::1
backup.example.com. 60 IN A 192.0.2.2
"#,
        );
        let mut delivery = delivery_with(
            resolver,
            vec![
                MxEntry::new("primary.example.com", 10),
                MxEntry::new("backup.example.com", 20),
            ],
        );
        run(&mut delivery).await.unwrap();

        assert_eq!(delivery.mx[0].a, vec!["192.0.2.1".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(
            delivery.mx[0].aaaa,
            vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]
        );
        assert_eq!(delivery.mx[1].a, vec!["192.0.2.2".parse::<Ipv4Addr>().unwrap()]);
        assert!(delivery.mx[1].aaaa.is_empty());
    }

    #[tokio::test]
    async fn one_failing_host_does_not_abort() {
        let resolver = TestResolver::default()
            .with_zone(
                r#"$ORIGIN example.com.
backup.example.com. 60 IN A 192.0.2.2
"#,
            )
            .with_error("primary.example.com", RecordType::A, DnsErrorCode::ServFail)
            .with_error(
                "primary.example.com",
                RecordType::AAAA,
                DnsErrorCode::ServFail,
            );
        let mut delivery = delivery_with(
            resolver,
            vec![
                MxEntry::new("primary.example.com", 10),
                MxEntry::new("backup.example.com", 20),
            ],
        );
        run(&mut delivery).await.unwrap();
        assert!(!delivery.mx[0].has_addresses());
        assert!(delivery.mx[1].has_addresses());
    }

    #[tokio::test]
    async fn all_failing_surfaces_first_error() {
        let resolver = TestResolver::default()
            .with_error("primary.example.com", RecordType::A, DnsErrorCode::ServFail)
            .with_error(
                "primary.example.com",
                RecordType::AAAA,
                DnsErrorCode::ServFail,
            );
        let mut delivery = delivery_with(resolver, vec![MxEntry::new("primary.example.com", 10)]);
        let err = run(&mut delivery).await.unwrap_err();
        assert_eq!(err.code, "ESERVFAIL");
        assert!(err.temporary);
    }

    #[tokio::test]
    async fn empty_answers_produce_synthetic_not_found() {
        let resolver = TestResolver::default().with_zone(
            r#"$ORIGIN example.com.
example.com. 60 IN TXT "unrelated"
"#,
        );
        let mut delivery = delivery_with(resolver, vec![MxEntry::new("mail.example.com", 10)]);
        let err = run(&mut delivery).await.unwrap_err();
        assert_eq!(err.code, "ENOTFOUND");
    }

    #[tokio::test]
    async fn literal_exchange_needs_no_lookup() {
        let mut delivery = delivery_with(
            TestResolver::default(),
            vec![MxEntry::new("192.0.2.9", 0)],
        );
        run(&mut delivery).await.unwrap();
        assert_eq!(delivery.mx[0].a, vec!["192.0.2.9".parse::<Ipv4Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn blocked_addresses_are_filtered() {
        let resolver = TestResolver::default().with_zone(
            r#"$ORIGIN example.com.
mail.example.com. 60 IN A 127.0.0.1
mail.example.com. 60 IN A 192.0.2.1
"#,
        );
        let mut delivery = delivery_with(resolver, vec![MxEntry::new("mail.example.com", 10)]);
        delivery.dns.block_local_addresses = true;
        run(&mut delivery).await.unwrap();
        assert_eq!(delivery.mx[0].a, vec!["192.0.2.1".parse::<Ipv4Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn ignore_ipv6_clears_supplied_aaaa() {
        let mut entry = MxEntry::new("mail.example.com", 10);
        entry.a.push("192.0.2.1".parse().unwrap());
        entry.aaaa.push("2001:db8::1".parse().unwrap());
        let mut delivery = delivery_with(TestResolver::default(), vec![entry]);
        delivery.dns.ignore_ipv6 = true;
        run(&mut delivery).await.unwrap();
        assert!(delivery.mx[0].aaaa.is_empty());
        assert!(!delivery.mx[0].a.is_empty());
    }
}
