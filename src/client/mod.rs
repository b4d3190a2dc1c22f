//! Client side of an ADS connection: sessions, symbol handles and the
//! registry that shares sessions between them.

use std::{io, time::Duration};
use thiserror::Error;

use crate::{
    address::{AmsNetId, MalformedAddress},
    ctype::{DecodeError, TypeMismatch, UnsupportedType},
    messages::{MessageError, error_description},
    utils::{
        get_default_source_net_id, get_default_source_port, get_default_tcp_port,
        get_default_timeout,
    },
};

mod circuit;
mod receivers;
mod registry;
mod session;
mod symbol;

pub use circuit::NotificationSample;
pub use receivers::{SubscriberRecvError, SubscriberTryRecvError, Subscription};
pub use registry::ConnectionRegistry;
pub use session::{DeviceInfo, Notifications, Session, SessionState};
pub use symbol::{Delivery, SymbolHandle, Update};

/// Failure talking to the PLC
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("ADS error {0:#x}: {desc}", desc = error_description(*.0))]
    Ads(u32),
    #[error("PLC sent an invalid response: {0}")]
    InvalidResponse(#[from] MessageError),
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("The connection to the PLC was lost")]
    Disconnected,
    #[error("The session is closed")]
    SessionClosed,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    MalformedAddress(#[from] MalformedAddress),
    #[error("{0}")]
    UnsupportedType(#[from] UnsupportedType),
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("{0}")]
    TypeMismatch(#[from] TypeMismatch),
    #[error("{0}")]
    Transport(#[from] TransportError),
}

/// Connection settings shared by every session of a registry
///
/// Defaults are read from the environment:
/// - `ADS_TCP_PORT`: TCP port of the PLC's AMS router, default 48898
/// - `ADS_TIMEOUT`: seconds to wait for any response, default 5
/// - `ADS_SOURCE_NET_ID`: our AMS net id, default the local IP plus `.1.1`
/// - `ADS_SOURCE_PORT`: our AMS port, default 32905
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tcp_port: u16,
    pub timeout: Duration,
    pub source_net_id: Option<AmsNetId>,
    pub source_port: u16,
    /// Requests that may wait for the connection before senders block
    pub queue_depth: usize,
    /// Notification samples buffered per subscription before dropping
    pub notification_buffer: usize,
    /// Updates buffered per handle subscriber before it lags
    pub update_capacity: usize,
    /// Delay between attempts to restore lost notifications
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            tcp_port: get_default_tcp_port(),
            timeout: Duration::from_secs_f32(get_default_timeout()),
            source_net_id: get_default_source_net_id(),
            source_port: get_default_source_port(),
            queue_depth: 32,
            notification_buffer: 64,
            update_capacity: 32,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig::default()
    }
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn source_net_id(mut self, net_id: AmsNetId) -> Self {
        self.source_net_id = Some(net_id);
        self
    }
    pub fn source_port(mut self, port: u16) -> Self {
        self.source_port = port;
        self
    }
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }
    pub fn notification_buffer(mut self, size: usize) -> Self {
        self.notification_buffer = size;
        self
    }
    pub fn update_capacity(mut self, size: usize) -> Self {
        self.update_capacity = size;
        self
    }
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ads_errors_are_described() {
        let error = TransportError::Ads(0x710);
        assert_eq!(error.to_string(), "ADS error 0x710: Symbol not found");
    }

    #[test]
    fn transport_errors_convert() {
        let error: TransportError = io::Error::other("reset").into();
        assert!(matches!(error, TransportError::IO(_)));
        let error: TransportError = DecodeError {
            type_name: "DINT".to_string(),
            expected: 4,
            actual: 2,
        }
        .into();
        assert!(matches!(error, TransportError::Decode(_)));
        let error: ClientError = error.into();
        assert!(matches!(error, ClientError::Transport(TransportError::Decode(_))));
    }

    #[test]
    fn config_builder() {
        let config = ClientConfig::new()
            .tcp_port(4000)
            .timeout(Duration::from_millis(250))
            .source_net_id("192.168.1.2.1.1".parse().unwrap());
        assert_eq!(config.tcp_port, 4000);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.source_net_id.unwrap().to_string(), "192.168.1.2.1.1");
    }
}
