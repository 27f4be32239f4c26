use crate::delivery::{Delivery, MxEntry};
use crate::error::ConnectError;
use crate::validate;
use std::net::IpAddr;

/// Produce the ordered MX entry list for the target, per RFC 5321
/// §5.1: the MX RRset when one exists, otherwise implicit fallback to
/// the domain's own address records.
pub(crate) async fn run(delivery: &mut Delivery) -> Result<(), ConnectError> {
    if delivery.is_ip {
        let mut entry = MxEntry::new(delivery.decoded_domain.clone(), 0);
        match delivery
            .decoded_domain
            .parse::<IpAddr>()
            .expect("formatter produced a valid IP")
        {
            IpAddr::V4(v4) => entry.a.push(v4),
            IpAddr::V6(v6) => entry.aaaa.push(v6),
        }
        delivery.mx = vec![entry];
        return Ok(());
    }

    let resolver = delivery.resolver();
    match dns_resolver::resolve_mx(&*resolver, &delivery.decoded_domain).await {
        Ok(mut records) => {
            // RFC 7505: a single "." exchange announces that the domain
            // accepts no mail at all
            if records.len() == 1 && records[0].exchange == "." {
                return Err(ConnectError::dns(
                    "ENULLMX",
                    format!("domain {} has a null MX record", delivery.decoded_domain),
                ));
            }

            records.sort_by_key(|r| r.priority);
            delivery.mx = records
                .into_iter()
                .map(|r| {
                    // drop the FQDN trailing dot for presentation
                    let mut entry =
                        MxEntry::new(r.exchange.trim_end_matches('.'), r.priority);
                    entry.mx = true;
                    entry
                })
                .collect();
            Ok(())
        }
        Err(err) if err.code().is_recoverable() => fallback_to_addresses(delivery).await,
        Err(err) => Err(ConnectError::from_dns(&err)),
    }
}

/// No MX records published: treat the domain itself as the (only) mail
/// host, one entry per address so that each can carry its own state.
async fn fallback_to_addresses(delivery: &mut Delivery) -> Result<(), ConnectError> {
    let resolver = delivery.resolver();
    let domain = delivery.decoded_domain.clone();
    let block_local = delivery.dns.block_local_addresses;

    match dns_resolver::resolve_ipv4(&*resolver, &domain).await {
        Ok(addrs) => {
            let mut rejection = None;
            let mut entries = vec![];
            for addr in addrs {
                match validate::invalid_reason(&IpAddr::V4(addr), block_local) {
                    Some(reason) => {
                        if rejection.is_none() {
                            rejection.replace(reason);
                        }
                    }
                    None => {
                        let mut entry = MxEntry::new(domain.clone(), 0);
                        entry.a.push(addr);
                        entries.push(entry);
                    }
                }
            }
            if entries.is_empty() {
                if let Some(reason) = rejection {
                    return Err(ConnectError::dns("EINVALIDIP", reason));
                }
            }
            delivery.mx = entries;
            return Ok(());
        }
        Err(err) if err.code().is_recoverable() => {}
        Err(err) => return Err(ConnectError::from_dns(&err)),
    }

    if !delivery.dns.ignore_ipv6 {
        match dns_resolver::resolve_ipv6(&*resolver, &domain).await {
            Ok(addrs) => {
                let mut rejection = None;
                let mut entries = vec![];
                for addr in addrs {
                    match validate::invalid_reason(&IpAddr::V6(addr), block_local) {
                        Some(reason) => {
                            if rejection.is_none() {
                                rejection.replace(reason);
                            }
                        }
                        None => {
                            let mut entry = MxEntry::new(domain.clone(), 0);
                            entry.aaaa.push(addr);
                            entries.push(entry);
                        }
                    }
                }
                if entries.is_empty() {
                    if let Some(reason) = rejection {
                        return Err(ConnectError::dns("EINVALIDIP", reason));
                    }
                }
                delivery.mx = entries;
                return Ok(());
            }
            Err(err) if err.code().is_recoverable() => {}
            Err(err) => return Err(ConnectError::from_dns(&err)),
        }
    }

    Err(ConnectError::dns(
        "ENOTFOUND",
        format!("no MX servers found for {domain}"),
    ))
}
