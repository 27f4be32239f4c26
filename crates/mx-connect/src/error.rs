use dns_resolver::DnsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Dns,
    Network,
    Policy,
    Dane,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dns => "dns",
            Self::Network => "network",
            Self::Policy => "policy",
            Self::Dane => "dane",
        })
    }
}

/// The structured error surfaced by every stage of the pipeline.
/// `code` is a short machine token, `response` a human-facing one-line
/// rendering of the code, and `temporary` signals that a later retry of
/// the whole attempt may succeed.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ConnectError {
    pub message: String,
    pub code: String,
    pub category: ErrorCategory,
    pub response: String,
    pub temporary: bool,
}

impl ConnectError {
    pub fn new(
        category: ErrorCategory,
        code: &str,
        message: impl Into<String>,
        temporary: bool,
    ) -> Self {
        let message = message.into();
        Self {
            response: code_response(code)
                .map(|r| r.to_string())
                .unwrap_or_else(|| message.clone()),
            message,
            code: code.to_string(),
            category,
            temporary,
        }
    }

    pub fn dns(code: &str, message: impl Into<String>) -> Self {
        // ENOTFOUND/ENODATA mean the records are simply not published;
        // retrying will not change that. Anything else is a lookup
        // failure and worth retrying later.
        let temporary = !matches!(code, "ENOTFOUND" | "ENODATA" | "EINVALIDIP" | "EBADNAME");
        Self::new(ErrorCategory::Dns, code, message, temporary)
    }

    pub fn network(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, code, message, true)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Policy, "EPOLICY", message, false)
    }

    pub fn policy_fetch(err: anyhow::Error) -> Self {
        Self::new(
            ErrorCategory::Policy,
            "EPOLICYFETCH",
            format!("failed to determine MTA-STS policy: {err:#}"),
            true,
        )
    }

    pub fn dane_lookup(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Dane, "EDANEFAIL", message, true)
    }

    pub fn from_dns(err: &DnsError) -> Self {
        Self::dns(err.code().as_str(), err.to_string())
    }

    pub fn from_dane(err: &dane::DaneError) -> Self {
        Self::new(ErrorCategory::Dane, err.code.as_str(), err.message.clone(), false)
    }

    pub fn from_io(err: &std::io::Error, addr: SocketAddr) -> Self {
        Self::network(io_error_code(err), format!("connect to {addr} failed: {err}"))
    }
}

/// Map socket errors onto the short tokens callers branch on.
pub fn io_error_code(err: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::ConnectionReset => "ECONNRESET",
        ErrorKind::ConnectionAborted => "ECONNABORTED",
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::BrokenPipe => "EPIPE",
        ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        ErrorKind::AddrInUse => "EADDRINUSE",
        ErrorKind::HostUnreachable => "EHOSTUNREACH",
        ErrorKind::NetworkUnreachable => "ENETUNREACH",
        ErrorKind::PermissionDenied => "EACCES",
        _ => "ECONNECTION",
    }
}

/// One-line human rendering for the known DNS and socket codes.
pub fn code_response(code: &str) -> Option<&'static str> {
    Some(match code {
        // DNS resolution
        "ENOTFOUND" => "The mail server for this domain could not be found",
        "ENODATA" => "No mail exchanger records were published for this domain",
        "ESERVFAIL" => "The DNS server failed to complete the lookup for this domain",
        "EREFUSED" => "The DNS server refused to answer the lookup for this domain",
        "ETIMEOUT" => "The DNS lookup for this domain timed out",
        "EDNSFAIL" => "The DNS lookup for this domain failed",
        "EBADNAME" => "The supplied target is not a valid hostname",
        "EINVALIDIP" => "The supplied target is not a valid IP address",
        "ENULLMX" => "This domain does not accept mail",
        // Sockets
        "ECONNREFUSED" => "The mail server refused the connection",
        "ECONNRESET" => "The connection was reset by the mail server",
        "ECONNABORTED" => "The connection to the mail server was aborted",
        "ETIMEDOUT" => "The connection attempt to the mail server timed out",
        "EPIPE" => "The connection to the mail server was closed unexpectedly",
        "EHOSTUNREACH" => "The mail server is unreachable",
        "ENETUNREACH" => "The network of the mail server is unreachable",
        "EADDRNOTAVAIL" => "The configured local address could not be used",
        "EADDRINUSE" => "The configured local address is already in use",
        "EACCES" => "The connection to the mail server was not permitted",
        "ECONNECTION" => "A connection to the mail server could not be established",
        // Policy and DANE
        "EPOLICY" => "The mail server is not allowed by the MTA-STS policy of this domain",
        "EPOLICYFETCH" => "The MTA-STS policy of this domain could not be retrieved",
        "EDANEFAIL" => "The TLSA records of the mail server could not be retrieved",
        "DANE_VERIFICATION_FAILED" => "The mail server certificate does not match its TLSA records",
        "DANE_VERIFICATION_ERROR" => "The mail server certificate could not be checked against its TLSA records",
        _ => return None,
    })
}
