use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::{select, sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::{
    address::poll_duration,
    client::{ClientError, Session, Subscription, TransportError},
    ctype::{TypeRegistry, Value},
    messages::NotificationAttributes,
    symbols::{self, SymbolInfo},
};

/// How a handle delivers continuous updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// No continuous delivery, only explicit reads and writes
    OneShot,
    /// Read periodically, delivering only changed values
    Polled(Duration),
    /// The PLC pushes changes as device notifications
    Notified,
}

impl Delivery {
    /// Polled for a poll rate in seconds, notified without one
    ///
    /// A rate that is not a usable interval (zero, negative, or too large)
    /// falls back to notifications.
    pub fn from_poll_rate(poll_rate: Option<f64>) -> Self {
        match poll_rate {
            None => Delivery::Notified,
            Some(rate) => match poll_duration(rate) {
                Some(interval) => Delivery::Polled(interval),
                None => {
                    warn!("Unusable poll rate {rate}, using notifications instead");
                    Delivery::Notified
                }
            },
        }
    }
}

/// Something that happened to a symbol
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A new value. Notified values carry the PLC timestamp, polled values the
    /// time they were read.
    Value { timestamp: SystemTime, value: Value },
    /// The connection to the PLC came up, or was lost
    Connection(bool),
}

/// What a late subscriber is told first
#[derive(Default)]
struct Latest {
    connected: Option<bool>,
    value: Option<Update>,
}

/// State shared by every open handle on one symbol of a session
///
/// Holds the resolved symbol and runs at most one delivery task, whose
/// updates fan out to the subscriptions of all the handles.
pub(crate) struct SharedSymbol {
    info: SymbolInfo,
    delivery: Delivery,
    updates: broadcast::Sender<Update>,
    /// Locked whilst sending, so subscribing never misses or repeats an update
    latest: Mutex<Latest>,
    /// Stops the delivery task
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Open handles. Once this reaches zero the state is finished for good.
    consumers: Mutex<usize>,
}

impl SharedSymbol {
    fn new(info: SymbolInfo, delivery: Delivery, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        SharedSymbol {
            info,
            delivery,
            updates,
            latest: Mutex::new(Latest::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            consumers: Mutex::new(1),
        }
    }

    /// Add a handle. Fails if the last handle already left.
    pub(crate) fn join(&self) -> bool {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        if *consumers == 0 {
            return false;
        }
        *consumers += 1;
        true
    }

    /// Remove a handle. Returns true if it was the last one.
    fn leave(&self) -> bool {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        *consumers = consumers.saturating_sub(1);
        *consumers == 0
    }

    fn publish(&self, update: Update) {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        match &update {
            Update::Connection(connected) => latest.connected = Some(*connected),
            Update::Value { .. } => latest.value = Some(update.clone()),
        }
        // No receivers is not an error; they may subscribe again
        let _ = self.updates.send(update);
    }

    fn subscribe(&self, closed: CancellationToken) -> Subscription {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        let mut backlog = Vec::new();
        if let Some(connected) = latest.connected {
            backlog.push(Update::Connection(connected));
            if connected {
                backlog.extend(latest.value.clone());
            }
        }
        Subscription::new(self.updates.subscribe(), closed).with_backlog(backlog)
    }

    fn start_delivery(self: &Arc<Self>, session: &Arc<Session>, symbol_path: &str) {
        if self.delivery == Delivery::OneShot {
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let worker = DeliveryWorker {
            session: session.clone(),
            shared: self.clone(),
            connected: None,
        };
        let span = debug_span!("delivery", symbol = symbol_path);
        task.replace(match self.delivery {
            Delivery::Polled(interval) => tokio::spawn(worker.poll(interval).instrument(span)),
            _ => tokio::spawn(worker.notify().instrument(span)),
        });
    }

    /// Stop delivery, waiting for the task to clean up after itself
    async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            // The task removes its notification before finishing
            if let Err(e) = task.await {
                warn!("Delivery task for {} failed: {e}", self.info.name);
            }
        }
    }
}

/// A typed, live view of one PLC variable
///
/// Opening a handle registers the symbol with the session, keeping the
/// session open until the handle is closed or dropped. Handles opened on the
/// same symbol and session with the same delivery share one resolution and
/// one delivery task; the first handle's type overrides apply to all.
pub struct SymbolHandle {
    session: Arc<Session>,
    symbol_path: String,
    shared: Arc<SharedSymbol>,
    /// Ends the subscriptions made through this handle
    handle_cancel: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for SymbolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolHandle")
            .field("target", self.session.target())
            .field("symbol_path", &self.symbol_path)
            .field("delivery", &self.shared.delivery)
            .finish()
    }
}

impl SymbolHandle {
    /// Open a handle, resolving the symbol unless it is already open
    ///
    /// With a poll rate (seconds) the value is polled, otherwise device
    /// notifications are used.
    pub async fn open(
        session: Arc<Session>,
        symbol_path: &str,
        poll_rate: Option<f64>,
        overrides: &TypeRegistry,
    ) -> Result<Self, ClientError> {
        Self::open_with(
            session,
            symbol_path,
            Delivery::from_poll_rate(poll_rate),
            overrides,
        )
        .await
    }

    pub async fn open_with(
        session: Arc<Session>,
        symbol_path: &str,
        delivery: Delivery,
        overrides: &TypeRegistry,
    ) -> Result<Self, ClientError> {
        session.register_symbol(symbol_path);
        if let Some(shared) = session.shared_symbol(symbol_path, delivery) {
            debug!("Sharing open symbol {symbol_path}");
            return Ok(Self::attach(session, symbol_path, shared));
        }
        let info = match symbols::resolve(&session, symbol_path, overrides).await {
            Ok(info) => info,
            Err(e) => {
                debug!("Could not open {symbol_path}: {e}");
                session.release_symbol(symbol_path);
                return Err(e);
            }
        };
        let shared = Arc::new(SharedSymbol::new(
            info,
            delivery,
            session.config().update_capacity,
        ));
        let shared = session.share_symbol(symbol_path, delivery, shared);
        Ok(Self::attach(session, symbol_path, shared))
    }

    fn attach(session: Arc<Session>, symbol_path: &str, shared: Arc<SharedSymbol>) -> Self {
        SymbolHandle {
            session,
            symbol_path: symbol_path.to_string(),
            handle_cancel: shared.cancel.child_token(),
            shared,
            closed: AtomicBool::new(false),
        }
    }

    pub fn symbol_path(&self) -> &str {
        &self.symbol_path
    }

    pub fn info(&self) -> &SymbolInfo {
        &self.shared.info
    }

    pub fn delivery(&self) -> Delivery {
        self.shared.delivery
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True if this handle shares its symbol state with `other`
    pub fn shares_with(&self, other: &SymbolHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(TransportError::SessionClosed.into())
        } else {
            Ok(())
        }
    }

    /// Read the current value
    pub async fn read(&self) -> Result<Value, ClientError> {
        self.check_open()?;
        let info = &self.shared.info;
        Ok(self
            .session
            .read_value(info.index_group, info.index_offset, &info.type_spec)
            .await?)
    }

    /// Write a value, converting it to the symbol type if needed
    pub async fn write(&self, value: &Value) -> Result<(), ClientError> {
        self.check_open()?;
        let info = &self.shared.info;
        self.session
            .write_value(info.index_group, info.index_offset, &info.type_spec, value)
            .await
    }

    /// Receive updates of this symbol
    ///
    /// The first subscription on the symbol starts continuous delivery. Must
    /// be called from within a tokio runtime.
    pub fn subscribe(&self) -> Subscription {
        let subscription = self.shared.subscribe(self.handle_cancel.clone());
        if !self.is_closed() {
            self.shared.start_delivery(&self.session, &self.symbol_path);
        }
        subscription
    }

    /// Stop delivery and release the symbol from the session
    ///
    /// Safe to call more than once. Updates not yet received by subscribers
    /// of this handle are discarded. Delivery carries on while other handles
    /// on the symbol are open.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing handle for {}", self.symbol_path);
        self.handle_cancel.cancel();
        if self.shared.leave() {
            self.session
                .forget_symbol(&self.symbol_path, self.shared.delivery, &self.shared);
            self.shared.stop().await;
        }
        self.session.release_symbol(&self.symbol_path);
    }
}

impl Drop for SymbolHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle_cancel.cancel();
        if self.shared.leave() {
            self.session
                .forget_symbol(&self.symbol_path, self.shared.delivery, &self.shared);
            self.shared.cancel.cancel();
        }
        self.session.release_symbol(&self.symbol_path);
    }
}

/// State owned by a running delivery task
struct DeliveryWorker {
    session: Arc<Session>,
    shared: Arc<SharedSymbol>,
    /// Last connection state announced, `None` before the first
    connected: Option<bool>,
}

impl DeliveryWorker {
    fn send(&self, update: Update) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.publish(update);
    }

    /// Announce the connection state if it changed. Returns true if it did.
    fn set_connected(&mut self, connected: bool) -> bool {
        if self.connected == Some(connected) {
            return false;
        }
        self.connected = Some(connected);
        self.send(Update::Connection(connected));
        true
    }

    async fn poll(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_value: Option<Value> = None;
        loop {
            select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = ticker.tick() => (),
            }
            let result = select! {
                _ = self.shared.cancel.cancelled() => break,
                r = self.session.read_value(
                    self.shared.info.index_group,
                    self.shared.info.index_offset,
                    &self.shared.info.type_spec,
                ) => r,
            };
            match result {
                Ok(value) => {
                    if self.set_connected(true) {
                        // Always deliver the first value after (re)connecting
                        last_value = None;
                    }
                    if last_value.as_ref() != Some(&value) {
                        last_value = Some(value.clone());
                        self.send(Update::Value {
                            timestamp: SystemTime::now(),
                            value,
                        });
                    }
                }
                Err(e) => {
                    if self.connected != Some(false) {
                        warn!("Polling {} failed: {e}", self.shared.info.name);
                    }
                    self.set_connected(false);
                }
            }
        }
        debug!("Stopped polling {}", self.shared.info.name);
    }

    async fn notify(mut self) {
        let attributes = NotificationAttributes::on_change(self.shared.info.size);
        let retry_interval = self.session.config().retry_interval;
        loop {
            let added = select! {
                _ = self.shared.cancel.cancelled() => break,
                r = self.session.add_notification(
                    self.shared.info.index_group,
                    self.shared.info.index_offset,
                    attributes,
                ) => r,
            };
            let mut notifications = match added {
                Ok(notifications) => notifications,
                Err(e) => {
                    if self.connected != Some(false) {
                        warn!("Could not add notification for {}: {e}", self.shared.info.name);
                    }
                    self.set_connected(false);
                    select! {
                        _ = self.shared.cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry_interval) => continue,
                    }
                }
            };
            debug!(
                "Receiving notifications for {} on handle {}",
                self.shared.info.name,
                notifications.handle()
            );
            self.set_connected(true);
            loop {
                let next = select! {
                    _ = self.shared.cancel.cancelled() => None,
                    s = notifications.recv() => Some(s),
                };
                let Some(sample) = next else {
                    if let Err(e) = self.session.delete_notification(notifications).await {
                        warn!("Failed to delete notification for {}: {e}", self.shared.info.name);
                    }
                    debug!("Stopped notifications for {}", self.shared.info.name);
                    return;
                };
                let Some(sample) = sample else {
                    warn!("Lost notifications for {}", self.shared.info.name);
                    self.set_connected(false);
                    break;
                };
                match self.shared.info.type_spec.decode(&sample.data) {
                    Ok(value) => self.send(Update::Value {
                        timestamp: sample.timestamp,
                        value,
                    }),
                    Err(e) => warn!("Could not decode notification for {}: {e}", self.shared.info.name),
                }
            }
            select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(retry_interval) => (),
            }
        }
        debug!("Stopped notifications for {}", self.shared.info.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_from_poll_rate() {
        assert_eq!(
            Delivery::from_poll_rate(Some(0.5)),
            Delivery::Polled(Duration::from_millis(500))
        );
        assert_eq!(Delivery::from_poll_rate(None), Delivery::Notified);
        assert_eq!(Delivery::from_poll_rate(Some(0.0)), Delivery::Notified);
        assert_eq!(Delivery::from_poll_rate(Some(1e30)), Delivery::Notified);
        assert_eq!(Delivery::from_poll_rate(Some(1e-12)), Delivery::Notified);
        assert_eq!(Delivery::from_poll_rate(Some(-1.0)), Delivery::Notified);
    }
}
