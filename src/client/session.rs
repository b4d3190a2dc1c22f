use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, Weak},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    address::TargetDescriptor,
    client::{
        ClientConfig, ClientError, Delivery, TransportError,
        circuit::{Circuit, NotificationSample},
        symbol::SharedSymbol,
    },
    ctype::{TypeSpec, Value},
    messages::{
        AddNotificationRequest, AdsState, AmsAddress, DeleteNotificationRequest,
        NotificationAttributes, ReadRequest, ReadWriteRequest, Request, Response, WriteRequest,
    },
    symbols::{self, SymbolEntry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

/// Identification returned by ReadDeviceInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}.{}", self.name, self.major, self.minor, self.build)
    }
}

/// Samples of one device notification, as pushed by the PLC
///
/// Yields `None` once the connection carrying the notification is gone; the
/// notification must then be added again.
pub struct Notifications {
    handle: u32,
    circuit: Circuit,
    samples: mpsc::Receiver<NotificationSample>,
}

impl Notifications {
    pub fn handle(&self) -> u32 {
        self.handle
    }
    pub async fn recv(&mut self) -> Option<NotificationSample> {
        self.samples.recv().await
    }
}

#[derive(Default)]
struct SessionInner {
    /// Registered symbol paths and how many holders each has
    symbols: HashMap<String, usize>,
    circuit: Option<Circuit>,
    /// Symbol state shared by every open handle on the same symbol
    handles: HashMap<(String, Delivery), Weak<SharedSymbol>>,
}

/// The connection to one ADS target
///
/// A session is open while at least one symbol is registered on it. The TCP
/// connection itself is established on the first request, and re-established
/// on a later request if it was lost while the session stayed open.
pub struct Session {
    target: TargetDescriptor,
    config: ClientConfig,
    inner: Mutex<SessionInner>,
    /// Serializes connection attempts
    connecting: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(target: TargetDescriptor, config: ClientConfig) -> Self {
        Session {
            target,
            config,
            inner: Mutex::new(SessionInner::default()),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // The state stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        if self.lock().symbols.is_empty() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    /// Number of holders of each registered symbol path
    pub fn registered_symbols(&self) -> HashMap<String, usize> {
        self.lock().symbols.clone()
    }

    /// Register interest in a symbol, opening the session if it was closed
    pub fn register_symbol(&self, symbol_path: &str) {
        let mut inner = self.lock();
        if inner.symbols.is_empty() {
            debug!("Opening session to {}", self.target);
        }
        *inner.symbols.entry(symbol_path.to_string()).or_default() += 1;
    }

    /// Drop one registration of a symbol. Returns true if this closed the session.
    pub fn release_symbol(&self, symbol_path: &str) -> bool {
        let mut inner = self.lock();
        let Some(count) = inner.symbols.get_mut(symbol_path) else {
            warn!("Release of unregistered symbol {symbol_path} on {}", self.target);
            return false;
        };
        *count -= 1;
        if *count == 0 {
            inner.symbols.remove(symbol_path);
        }
        if !inner.symbols.is_empty() {
            return false;
        }
        debug!("Last symbol released, closing session to {}", self.target);
        if let Some(circuit) = inner.circuit.take() {
            circuit.close();
        }
        true
    }

    /// Join the state of an already open handle on this symbol, if there is one
    pub(crate) fn shared_symbol(
        &self,
        symbol_path: &str,
        delivery: Delivery,
    ) -> Option<Arc<SharedSymbol>> {
        let inner = self.lock();
        inner
            .handles
            .get(&(symbol_path.to_string(), delivery))
            .and_then(Weak::upgrade)
            .filter(|shared| shared.join())
    }

    /// Make freshly resolved symbol state the shared one
    ///
    /// If another handle got there first whilst we were resolving, join that
    /// one instead and return it.
    pub(crate) fn share_symbol(
        &self,
        symbol_path: &str,
        delivery: Delivery,
        shared: Arc<SharedSymbol>,
    ) -> Arc<SharedSymbol> {
        let mut inner = self.lock();
        let key = (symbol_path.to_string(), delivery);
        if let Some(existing) = inner
            .handles
            .get(&key)
            .and_then(Weak::upgrade)
            .filter(|existing| existing.join())
        {
            return existing;
        }
        inner.handles.insert(key, Arc::downgrade(&shared));
        shared
    }

    /// Forget shared symbol state once its last handle has gone
    pub(crate) fn forget_symbol(
        &self,
        symbol_path: &str,
        delivery: Delivery,
        shared: &Arc<SharedSymbol>,
    ) {
        let mut inner = self.lock();
        let key = (symbol_path.to_string(), delivery);
        let is_current = inner
            .handles
            .get(&key)
            .is_some_and(|current| std::ptr::eq(current.as_ptr(), Arc::as_ptr(shared)));
        if is_current {
            inner.handles.remove(&key);
        }
    }

    /// Get a live connection, connecting if needed
    async fn circuit(&self) -> Result<Circuit, TransportError> {
        if let Some(circuit) = self.live_circuit()? {
            return Ok(circuit);
        }
        let _connecting = self.connecting.lock().await;
        // Somebody else may have connected whilst we waited
        if let Some(circuit) = self.live_circuit()? {
            return Ok(circuit);
        }
        let circuit = Circuit::connect(
            SocketAddr::from((self.target.ip_address, self.config.tcp_port)),
            AmsAddress::new(self.target.ams_net_id, self.target.port),
            self.config.source_net_id,
            self.config.source_port,
            self.config.timeout,
            self.config.queue_depth,
        )
        .await?;
        let mut inner = self.lock();
        if inner.symbols.is_empty() {
            // Closed whilst we were connecting
            circuit.close();
            return Err(TransportError::SessionClosed);
        }
        inner.circuit = Some(circuit.clone());
        Ok(circuit)
    }

    fn live_circuit(&self) -> Result<Option<Circuit>, TransportError> {
        let inner = self.lock();
        if inner.symbols.is_empty() {
            return Err(TransportError::SessionClosed);
        }
        Ok(inner.circuit.as_ref().filter(|c| !c.is_closed()).cloned())
    }

    /// True if the TCP connection is currently up
    pub fn is_connected(&self) -> bool {
        self.lock()
            .circuit
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        self.circuit().await?.call(request).await
    }

    pub async fn read(
        &self,
        index_group: u32,
        index_offset: u32,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let request = Request::Read(ReadRequest {
            index_group,
            index_offset,
            length: length as u32,
        });
        match self.call(request).await? {
            Response::Read(response) => Ok(response.data),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn read_value(
        &self,
        index_group: u32,
        index_offset: u32,
        spec: &TypeSpec,
    ) -> Result<Value, TransportError> {
        let data = self.read(index_group, index_offset, spec.byte_size()).await?;
        Ok(spec.decode(&data)?)
    }

    pub async fn write(
        &self,
        index_group: u32,
        index_offset: u32,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let request = Request::Write(WriteRequest {
            index_group,
            index_offset,
            data: data.to_vec(),
        });
        match self.call(request).await? {
            Response::Write(_) => Ok(()),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn write_value(
        &self,
        index_group: u32,
        index_offset: u32,
        spec: &TypeSpec,
        value: &Value,
    ) -> Result<(), ClientError> {
        let data = spec.encode(value)?;
        Ok(self.write(index_group, index_offset, &data).await?)
    }

    /// Write `data`, then read back up to `read_length` bytes
    pub async fn read_write(
        &self,
        index_group: u32,
        index_offset: u32,
        read_length: usize,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let request = Request::ReadWrite(ReadWriteRequest {
            index_group,
            index_offset,
            read_length: read_length as u32,
            data: data.to_vec(),
        });
        match self.call(request).await? {
            Response::ReadWrite(response) => Ok(response.data),
            other => Err(unexpected_response(other)),
        }
    }

    /// Ask the PLC to push changes of a memory area
    pub async fn add_notification(
        &self,
        index_group: u32,
        index_offset: u32,
        attributes: NotificationAttributes,
    ) -> Result<Notifications, TransportError> {
        let circuit = self.circuit().await?;
        let (tx, rx) = mpsc::channel(self.config.notification_buffer.max(1));
        let handle = circuit
            .subscribe(
                AddNotificationRequest {
                    index_group,
                    index_offset,
                    attributes,
                },
                tx,
            )
            .await?;
        Ok(Notifications {
            handle,
            circuit,
            samples: rx,
        })
    }

    /// Stop a device notification
    ///
    /// If the connection it was added on is already gone, so is the
    /// notification, and this does nothing.
    pub async fn delete_notification(
        &self,
        notifications: Notifications,
    ) -> Result<(), TransportError> {
        let Notifications {
            handle, circuit, ..
        } = notifications;
        if circuit.is_closed() {
            return Ok(());
        }
        let request = Request::DeleteNotification(DeleteNotificationRequest { handle });
        match circuit.call(request).await? {
            Response::DeleteNotification(_) => Ok(()),
            other => Err(unexpected_response(other)),
        }
    }

    /// Read the ADS and device state of the target
    pub async fn read_state(&self) -> Result<(AdsState, u16), TransportError> {
        match self.call(Request::ReadState).await? {
            Response::ReadState(state) => Ok((AdsState::from(state.ads_state), state.device_state)),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn read_device_info(&self) -> Result<DeviceInfo, TransportError> {
        match self.call(Request::ReadDeviceInfo).await? {
            Response::DeviceInfo(info) => Ok(DeviceInfo {
                name: info.name,
                major: info.major,
                minor: info.minor,
                build: info.build,
            }),
            other => Err(unexpected_response(other)),
        }
    }

    /// Upload and parse the complete symbol table of the target
    pub async fn enumerate_symbols(&self) -> Result<HashMap<String, SymbolEntry>, TransportError> {
        symbols::enumerate_symbols(self).await
    }
}

fn unexpected_response(response: Response) -> TransportError {
    TransportError::InvalidResponse(crate::messages::MessageError::InvalidField(
        "response".to_string(),
        format!("{response:?}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            TargetDescriptor::from_ip("127.0.0.1".parse().unwrap()),
            ClientConfig::default(),
        )
    }

    #[test]
    fn refcounting_drives_state() {
        let session = session();
        assert_eq!(session.state(), SessionState::Closed);
        session.register_symbol("GVL.a");
        session.register_symbol("GVL.a");
        session.register_symbol("GVL.b");
        assert_eq!(session.state(), SessionState::Open);
        assert!(!session.release_symbol("GVL.a"));
        assert!(!session.release_symbol("GVL.b"));
        assert_eq!(session.registered_symbols().get("GVL.a"), Some(&1));
        assert!(session.release_symbol("GVL.a"));
        assert_eq!(session.state(), SessionState::Closed);
        // Releasing again is harmless
        assert!(!session.release_symbol("GVL.a"));
    }

    #[tokio::test]
    async fn closed_session_refuses_requests() {
        let session = session();
        let result = session.read(0x4020, 0, 4).await;
        assert!(matches!(result, Err(TransportError::SessionClosed)));
    }
}
