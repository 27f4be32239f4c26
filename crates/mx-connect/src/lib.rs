//! Establish a TCP connection to the correct mail exchange for a
//! target domain, email address or IP literal.
//!
//! From a single target this crate locates the candidate mail hosts
//! (MX with RFC 5321 address-record fallback), expands them to
//! individual IP destinations, checks them against the domain's
//! MTA-STS policy, resolves DANE TLSA records, and then walks the
//! candidates in priority order until one accepts a connection. The
//! result carries the established stream together with the material an
//! SMTP client needs to upgrade to TLS with the right authentication
//! context.
//!
//! ```no_run
//! # async fn example() -> Result<(), mx_connect::ConnectError> {
//! let connection = mx_connect::connect("user@example.com").await?;
//! println!(
//!     "connected to {}[{}]:{}",
//!     connection.hostname, connection.host, connection.port
//! );
//! # Ok(())
//! # }
//! ```
//!
//! The SMTP conversation, the TLS handshake and retry scheduling are
//! deliberately out of scope; callers drive those with the returned
//! [`Connection`].

mod connect;
mod dane;
mod delivery;
mod error;
mod format;
mod hook;
mod ip;
mod mx;
mod pipeline;
mod policy;
mod validate;

pub use delivery::{
    ConnectOptions, Connection, DaneConfig, Delivery, DnsConfig, MtaStsConfig, MxEntry, MxHint,
    TlsaResolver,
};
pub use error::{code_response, io_error_code, ConnectError, ErrorCategory};
pub use hook::{ConnectErrorHook, ConnectHook, ConnectPlan, LogRecord, Logger};
pub use validate::{check_addr_str, invalid_reason, is_local};

pub use ::dane::{
    tlsa_fqdn, CertAssociation, CertUsage, DaneError, DaneErrorCode, DaneMatch, DaneVerifier,
    Matching, Selector, TlsaRecord,
};
pub use dns_resolver::{DnsError, DnsErrorCode, HickoryResolver, Resolver, TestResolver};
pub use mta_sts::policy::{PolicyMatch, PolicyMode};
pub use mta_sts::{CachedPolicy, Get, MemoryPolicyCache, MtaStsPolicy, PolicyCache};

/// Resolve the target described by `options` and connect to the best
/// reachable MX host. Accepts a bare `&str`/`String` target or a full
/// [`ConnectOptions`].
///
/// The returned future is drop-cancellable at every suspension point:
/// nothing is spawned, and an abandoned in-flight socket is closed.
/// Callers wanting an overall deadline wrap this in
/// `tokio::time::timeout`.
pub async fn connect(options: impl Into<ConnectOptions>) -> Result<Connection, ConnectError> {
    let mut delivery = Delivery::new(options.into())?;
    pipeline::execute(&mut delivery).await
}
