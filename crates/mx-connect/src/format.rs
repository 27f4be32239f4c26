use crate::delivery::Delivery;
use crate::error::ConnectError;
use std::net::IpAddr;

/// Classify the target as an IP literal or a domain name, and bring a
/// domain into its A-label (punycode) form so that every later stage
/// works with a net-resolvable ASCII name.
pub(crate) fn run(delivery: &mut Delivery) -> Result<(), ConnectError> {
    let raw = delivery.domain.trim().to_string();

    if raw.is_empty() {
        return Err(ConnectError::dns("EBADNAME", "empty target"));
    }

    if let Some(ip) = parse_ip_literal(&raw)? {
        if ip.is_ipv6() && delivery.dns.ignore_ipv6 {
            return Err(ConnectError::dns(
                "EINVALIDIP",
                format!("IPv6 target {ip} not usable: IPv6 is disabled"),
            ));
        }
        delivery.is_ip = true;
        delivery.decoded_domain = ip.to_string();
        return Ok(());
    }

    let decoded = idna::domain_to_ascii(&raw)
        .map_err(|err| ConnectError::dns("EBADNAME", format!("invalid domain {raw:?}: {err}")))?;
    if decoded.is_empty() {
        return Err(ConnectError::dns(
            "EBADNAME",
            format!("invalid domain {raw:?}"),
        ));
    }

    delivery.is_punycode = decoded != raw.to_lowercase();
    delivery.decoded_domain = decoded;
    Ok(())
}

/// Accepts the RFC 5321 bracketed forms `[192.0.2.1]` and
/// `[IPv6:2001:db8::1]` as well as a bare address. An unbracketed
/// IPv6 address is not RFC-conforming but widely used, so we take it.
fn parse_ip_literal(raw: &str) -> Result<Option<IpAddr>, ConnectError> {
    if raw.starts_with('[') {
        if !raw.ends_with(']') {
            return Err(ConnectError::dns(
                "EINVALIDIP",
                format!("target {raw:?} is a malformed literal with no trailing `]`"),
            ));
        }
        let lowered = raw.to_ascii_lowercase();
        let literal = &lowered[1..lowered.len() - 1];
        let literal = literal.strip_prefix("ipv6:").unwrap_or(literal);

        return match literal.parse::<IpAddr>() {
            Ok(ip) => Ok(Some(ip)),
            Err(err) => Err(ConnectError::dns(
                "EINVALIDIP",
                format!("invalid address literal {raw:?}: {err}"),
            )),
        };
    }

    Ok(raw.parse::<IpAddr>().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delivery::ConnectOptions;

    fn format(target: &str) -> Result<Delivery, ConnectError> {
        let mut delivery = Delivery::new(ConnectOptions::new(target))?;
        run(&mut delivery)?;
        Ok(delivery)
    }

    #[test]
    fn domains() {
        let d = format("Example.com").unwrap();
        assert!(!d.is_ip);
        assert!(!d.is_punycode);
        assert_eq!(d.decoded_domain, "example.com");

        let d = format("bücher.example").unwrap();
        assert!(d.is_punycode);
        assert_eq!(d.decoded_domain, "xn--bcher-kva.example");
    }

    #[test]
    fn already_alabel_is_idempotent() {
        let d = format("xn--bcher-kva.example").unwrap();
        assert!(!d.is_punycode);
        assert_eq!(d.decoded_domain, "xn--bcher-kva.example");
    }

    #[test]
    fn ip_literals() {
        let d = format("[192.0.2.1]").unwrap();
        assert!(d.is_ip);
        assert_eq!(d.decoded_domain, "192.0.2.1");

        let d = format("192.0.2.1").unwrap();
        assert!(d.is_ip);

        let d = format("[IPv6:2001:db8::1]").unwrap();
        assert!(d.is_ip);
        assert_eq!(d.decoded_domain, "2001:db8::1");

        let d = format("2001:db8::1").unwrap();
        assert!(d.is_ip);
    }

    #[test]
    fn bad_literals() {
        let err = format("[not-an-ip]").unwrap_err();
        assert_eq!(err.code, "EINVALIDIP");
        assert_eq!(err.category, crate::ErrorCategory::Dns);

        let err = format("[192.0.2.1").unwrap_err();
        assert_eq!(err.code, "EINVALIDIP");
    }

    #[test]
    fn ipv6_literal_with_ignore_ipv6() {
        let mut delivery = Delivery::new(ConnectOptions::new("[IPv6:2001:db8::1]")).unwrap();
        delivery.dns.ignore_ipv6 = true;
        let err = run(&mut delivery).unwrap_err();
        assert_eq!(err.category, crate::ErrorCategory::Dns);
    }

    #[test]
    fn empty_target() {
        assert_eq!(format("").unwrap_err().code, "EBADNAME");
        assert_eq!(format("user@").unwrap_err().code, "EBADNAME");
    }
}
