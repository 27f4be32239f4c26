use crate::delivery::{Connection, Delivery};
use crate::error::ConnectError;
use crate::hook::{self, ConnectPlan};
use dane::{DaneVerifier, TlsaRecord};
use mta_sts::policy::PolicyMatch;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

/// Upper bound on connection attempts for one call; everything past
/// this is noise from pathological MX sets.
const MAX_CANDIDATES: usize = 20;

#[derive(Clone)]
struct Candidate {
    ip: IpAddr,
    ipv6: bool,
    priority: u16,
    hostname: String,
    policy_match: Option<PolicyMatch>,
    tlsa_records: Option<Vec<TlsaRecord>>,
    dane_lookup_failed: bool,
    dane_lookup_error: Option<ConnectError>,
}

/// Flatten the MX set into (exchange, address) candidates:
/// deduplicated by address across entries (first occurrence wins),
/// ignore-listed addresses dropped, stable priority sort with the
/// family preference as tie-break, capped. Returns the candidate list
/// and the count before the ignore filter.
fn build_candidates(delivery: &Delivery) -> (Vec<Candidate>, usize) {
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut list: Vec<Candidate> = vec![];

    for entry in &delivery.mx {
        let mut push = |ip: IpAddr, ipv6: bool, list: &mut Vec<Candidate>| {
            if seen.insert(ip) {
                list.push(Candidate {
                    ip,
                    ipv6,
                    priority: entry.priority,
                    hostname: entry.exchange.clone(),
                    policy_match: entry.policy_match,
                    tlsa_records: entry.tlsa_records.clone(),
                    dane_lookup_failed: entry.dane_lookup_failed,
                    dane_lookup_error: entry.dane_lookup_error.clone(),
                });
            }
        };
        for addr in &entry.a {
            push(IpAddr::V4(*addr), false, &mut list);
        }
        for addr in &entry.aaaa {
            push(IpAddr::V6(*addr), true, &mut list);
        }
    }

    let before_filter = list.len();
    list.retain(|c| !delivery.ignore_mx_hosts.contains(&c.ip));

    if delivery.dns.prefer_ipv6 {
        list.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.ipv6.cmp(&a.ipv6)));
    } else {
        list.sort_by_key(|c| c.priority);
    }
    list.truncate(MAX_CANDIDATES);

    (list, before_filter)
}

pub(crate) async fn run(delivery: &mut Delivery) -> Result<Connection, ConnectError> {
    let (candidates, before_filter) = build_candidates(delivery);

    if candidates.is_empty() {
        if before_filter > 0 {
            // The ignore list emptied the set; report whatever the
            // caller captured from their previous attempt
            return Err(delivery.mx_last_error.clone().unwrap_or_else(|| {
                ConnectError::network(
                    "ECONNECTION",
                    format!(
                        "all MX hosts for {} are on the ignore list",
                        delivery.decoded_domain
                    ),
                )
            }));
        }
        return Err(ConnectError::dns(
            "ENOTFOUND",
            format!("no MX servers found for {}", delivery.decoded_domain),
        ));
    }

    let mut first_error: Option<ConnectError> = None;

    for candidate in candidates {
        let (local_address, local_hostname) = delivery.local_binding(candidate.ipv6);
        let mut plan = ConnectPlan {
            port: delivery.port,
            host: candidate.ip,
            hostname: candidate.hostname.clone(),
            // Connecting to ourselves: binding the same address would
            // collide, so leave the source to the kernel
            local_address: local_address.filter(|local| *local != candidate.ip),
            local_hostname,
            socket: None,
        };

        // MTA-STS gate
        if let Some(verdict) = &candidate.policy_match {
            if !verdict.valid && !verdict.testing {
                let err = ConnectError::policy(format!(
                    "MX {} is not allowed by the MTA-STS policy for {}",
                    candidate.hostname, delivery.decoded_domain
                ));
                hook::emit(
                    &delivery.mta_sts.logger,
                    "mta-sts",
                    false,
                    err.message.clone(),
                );
                delivery.notify_connect_error(&err, &plan);
                first_error.get_or_insert(err);
                continue;
            }
            hook::emit(
                &delivery.mta_sts.logger,
                "mta-sts",
                true,
                if verdict.valid {
                    format!(
                        "MX {} matches the MTA-STS policy for {} (mode={})",
                        candidate.hostname, delivery.decoded_domain, verdict.mode
                    )
                } else {
                    format!(
                        "MX {} does not match the MTA-STS policy for {}, continuing in testing mode",
                        candidate.hostname, delivery.decoded_domain
                    )
                },
            );
        }

        // DANE lookup gate: an unanswerable TLSA question means we
        // cannot know whether TLS pinning applies, so the host must
        // not be contacted while verification is on
        if candidate.dane_lookup_failed && delivery.dane.verify {
            let err = candidate.dane_lookup_error.clone().unwrap_or_else(|| {
                ConnectError::dane_lookup(format!(
                    "TLSA lookup for {} failed",
                    candidate.hostname
                ))
            });
            delivery.notify_connect_error(&err, &plan);
            first_error.get_or_insert(err);
            continue;
        }

        // Pre-connect hook: errors here are fatal for the whole call
        if let Some(connect_hook) = delivery.connect_hook.clone() {
            connect_hook.invoke(&*delivery, &mut plan).await?;
        }

        let socket = match plan.socket.take() {
            // The hook supplied its own transport
            Some(socket) => socket,
            None => match open_socket(&plan, delivery.max_connect_time).await {
                Ok(socket) => socket,
                Err(err) => {
                    delivery.notify_connect_error(&err, &plan);
                    first_error.get_or_insert(err);
                    continue;
                }
            },
        };

        let local = socket.local_addr().ok();
        tracing::debug!(
            "connected to {}[{}]:{} from {local:?}",
            candidate.hostname,
            candidate.ip,
            delivery.port
        );

        let tlsa_records = candidate
            .tlsa_records
            .filter(|records| !records.is_empty());
        let dane_verifier = tlsa_records.as_ref().map(|records| {
            let logger = delivery.dane.logger.clone();
            DaneVerifier::new(records.clone())
                .with_enforce(delivery.dane.verify)
                .with_log(Arc::new(move |message: &str, success: bool| {
                    hook::emit(&logger, "dane", success, message.to_string());
                }))
        });

        return Ok(Connection {
            hostname: candidate.hostname,
            host: candidate.ip,
            port: delivery.port,
            local_address: local.map(|addr| addr.ip()),
            local_port: local.map(|addr| addr.port()),
            local_hostname: plan.local_hostname.take().or_else(default_hostname),
            dane_enabled: delivery.dane.enabled,
            require_tls: tlsa_records.is_some(),
            dane_verifier,
            tlsa_records,
            policy_match: candidate.policy_match,
            socket,
        });
    }

    Err(first_error.unwrap_or_else(|| {
        ConnectError::network(
            "ECONNECTION",
            format!(
                "unable to establish connection to any MX host of {}",
                delivery.decoded_domain
            ),
        )
    }))
}

/// One TCP attempt with the per-host deadline. The timeout dropping
/// the connect future tears the socket down, so exactly one of
/// connected/timed-out/errored settles the attempt and no descriptor
/// outlives a lost race.
async fn open_socket(plan: &ConnectPlan, max_connect_time: Duration) -> Result<TcpStream, ConnectError> {
    let addr = SocketAddr::new(plan.host, plan.port);

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|err| ConnectError::from_io(&err, addr))?;

    if let Some(local) = plan.local_address {
        socket
            .bind(SocketAddr::new(local, 0))
            .map_err(|err| ConnectError::from_io(&err, addr))?;
    }

    match timeout(max_connect_time, socket.connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(ConnectError::from_io(&err, addr)),
        Err(_) => Err(ConnectError::network(
            "ETIMEDOUT",
            format!("connect to {addr} timed out after {max_connect_time:?}"),
        )),
    }
}

fn default_hostname() -> Option<String> {
    gethostname::gethostname().to_str().map(|s| s.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delivery::{ConnectOptions, MxEntry};

    fn entry(exchange: &str, priority: u16, a: &[&str], aaaa: &[&str]) -> MxEntry {
        let mut entry = MxEntry::new(exchange, priority);
        entry.a = a.iter().map(|s| s.parse().unwrap()).collect();
        entry.aaaa = aaaa.iter().map(|s| s.parse().unwrap()).collect();
        entry
    }

    fn delivery_with(mx: Vec<MxEntry>) -> Delivery {
        let mut delivery = Delivery::new(ConnectOptions::new("example.com")).unwrap();
        delivery.decoded_domain = "example.com".to_string();
        delivery.mx = mx;
        delivery
    }

    #[test]
    fn candidates_are_deduplicated_and_sorted() {
        let delivery = delivery_with(vec![
            entry("backup.example.com", 20, &["192.0.2.2", "192.0.2.1"], &[]),
            entry("primary.example.com", 10, &["192.0.2.1"], &["2001:db8::1"]),
        ]);
        let (candidates, before) = build_candidates(&delivery);
        // 192.0.2.1 appears in both entries and is deduplicated during
        // flattening, attributed to the entry seen first
        assert_eq!(before, 3);
        let ips: Vec<String> = candidates.iter().map(|c| c.ip.to_string()).collect();
        assert_eq!(ips, vec!["2001:db8::1", "192.0.2.2", "192.0.2.1"]);
        assert_eq!(candidates[0].hostname, "primary.example.com");
        let dup = candidates
            .iter()
            .find(|c| c.ip == "192.0.2.1".parse::<IpAddr>().unwrap())
            .unwrap();
        assert_eq!(dup.hostname, "backup.example.com");

        let mut unique = HashSet::new();
        assert!(candidates.iter().all(|c| unique.insert(c.ip)));
    }

    #[test]
    fn prefer_ipv6_breaks_ties() {
        let mut delivery = delivery_with(vec![entry(
            "mail.example.com",
            10,
            &["192.0.2.1"],
            &["2001:db8::1"],
        )]);
        delivery.dns.prefer_ipv6 = true;
        let (candidates, _) = build_candidates(&delivery);
        assert!(candidates[0].ipv6);
        assert!(!candidates[1].ipv6);
    }

    #[test]
    fn candidate_cap() {
        let addrs: Vec<String> = (1..=30).map(|i| format!("192.0.2.{i}")).collect();
        let refs: Vec<&str> = addrs.iter().map(|s| s.as_str()).collect();
        let delivery = delivery_with(vec![entry("mail.example.com", 10, &refs, &[])]);
        let (candidates, before) = build_candidates(&delivery);
        assert_eq!(before, 30);
        assert_eq!(candidates.len(), MAX_CANDIDATES);
    }

    #[tokio::test]
    async fn empty_set_reports_no_mx() {
        let mut delivery = delivery_with(vec![]);
        let err = run(&mut delivery).await.unwrap_err();
        assert_eq!(err.category, crate::ErrorCategory::Dns);
        assert_eq!(err.code, "ENOTFOUND");
    }

    #[tokio::test]
    async fn ignore_list_empties_set() {
        let mut delivery = delivery_with(vec![entry("mail.example.com", 10, &["192.0.2.1"], &[])]);
        delivery.ignore_mx_hosts.insert("192.0.2.1".parse().unwrap());

        let err = run(&mut delivery).await.unwrap_err();
        assert_eq!(err.category, crate::ErrorCategory::Network);
        assert!(err.temporary);

        // A captured previous error takes precedence
        let stored = ConnectError::network("ECONNREFUSED", "previous attempt refused");
        delivery.mx_last_error = Some(stored.clone());
        let err = run(&mut delivery).await.unwrap_err();
        assert_eq!(err, stored);
    }

    #[tokio::test]
    async fn connect_timeout_is_retryable() {
        // 192.0.2.0/24 is TEST-NET-1: nothing answers there. Either
        // the 1ms deadline fires or the network stack refuses; both
        // must surface as a temporary network error.
        let mut delivery = delivery_with(vec![entry("mail.example.com", 10, &["192.0.2.1"], &[])]);
        delivery.max_connect_time = Duration::from_millis(1);
        let err = run(&mut delivery).await.unwrap_err();
        assert_eq!(err.category, crate::ErrorCategory::Network);
        assert!(err.temporary);
    }
}
