use crate::delivery::Delivery;
use crate::error::ConnectError;
use futures::future::BoxFuture;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// One structured log event from the policy or DANE machinery.
/// `action` is `"mta-sts"` or `"dane"`.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub action: &'static str,
    pub message: String,
    pub success: bool,
}

pub type Logger = Arc<dyn Fn(&LogRecord) + Send + Sync>;

pub(crate) fn emit(logger: &Option<Logger>, action: &'static str, success: bool, message: String) {
    if success {
        tracing::debug!("{action}: {message}");
    } else {
        tracing::warn!("{action}: {message}");
    }
    if let Some(logger) = logger {
        logger(&LogRecord {
            action,
            message,
            success,
        });
    }
}

/// What the connection engine is about to do for one candidate. Handed
/// to the connect hook before the socket is opened; a hook that stores
/// a stream into `socket` takes over the transport (SOCKS/Tor style
/// diversion) and no TCP connection is made by the engine.
#[derive(Debug)]
pub struct ConnectPlan {
    pub port: u16,
    pub host: IpAddr,
    pub hostname: String,
    pub local_address: Option<IpAddr>,
    pub local_hostname: Option<String>,
    pub socket: Option<TcpStream>,
}

/// Runs before each TCP attempt. An error return is fatal to the whole
/// call: remaining candidates are not tried.
pub trait ConnectHook: Send + Sync {
    fn invoke<'a>(
        &'a self,
        delivery: &'a Delivery,
        plan: &'a mut ConnectPlan,
    ) -> BoxFuture<'a, Result<(), ConnectError>>;
}

/// Best-effort notification of every retryable per-host failure.
pub type ConnectErrorHook = Arc<dyn Fn(&ConnectError, &Delivery, &ConnectPlan) + Send + Sync>;
