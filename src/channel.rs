//! Adapter between a [`SymbolHandle`] and a host application's data channel.
//!
//! A host (e.g. a display manager) implements [`Channel`] for each widget
//! channel it wants connected to a PLC variable. [`ChannelConnection`] opens
//! the symbol the channel's address names, pushes every update to the
//! channel as a map of [`DataKey`] to [`ChannelValue`], and writes values the
//! host hands to [`ChannelConnection::receive_value`] back to the PLC.

use std::{collections::HashMap, sync::Arc, time::SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    client::{ClientError, ConnectionRegistry, SubscriberRecvError, SymbolHandle, Update},
    ctype::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKey {
    /// Whether the PLC is reachable, as a [`ChannelValue::Bool`]
    Connection,
    Value,
    /// When the value was taken
    Timestamp,
    /// Whether the symbol may be written, as a [`ChannelValue::Bool`]
    WriteAccess,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    Bool(bool),
    Value(Value),
    Timestamp(SystemTime),
}

pub type ChannelData = HashMap<DataKey, ChannelValue>;

/// The host side of a connection
pub trait Channel: Send + Sync + 'static {
    /// The `ads://` address of the symbol this channel shows
    fn address(&self) -> &str;

    /// Receive new data for the channel. Only the keys that changed are present.
    fn send_value(&self, data: ChannelData);
}

/// A live link between a [`Channel`] and a PLC symbol
pub struct ChannelConnection<C: Channel> {
    handle: SymbolHandle,
    channel: Arc<C>,
    forwarder: JoinHandle<()>,
}

impl<C: Channel> ChannelConnection<C> {
    /// Open the symbol for a channel and start forwarding its updates
    ///
    /// If the symbol cannot be opened the channel is told it is disconnected,
    /// and the error returned.
    pub async fn connect(registry: &ConnectionRegistry, channel: Arc<C>) -> Result<Self, ClientError> {
        let handle = match registry.open_symbol(channel.address()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Could not connect channel {}: {e}", channel.address());
                channel.send_value(HashMap::from([(DataKey::Connection, ChannelValue::Bool(false))]));
                return Err(e);
            }
        };
        channel.send_value(HashMap::from([
            (DataKey::Connection, ChannelValue::Bool(true)),
            (
                DataKey::WriteAccess,
                ChannelValue::Bool(!handle.info().is_read_only()),
            ),
        ]));

        let mut subscription = handle.subscribe();
        let target = channel.clone();
        let forwarder = tokio::spawn(async move {
            // Already announced above
            let mut connected = true;
            loop {
                let data = match subscription.recv().await {
                    Ok(Update::Value { timestamp, value }) => HashMap::from([
                        (DataKey::Value, ChannelValue::Value(value)),
                        (DataKey::Timestamp, ChannelValue::Timestamp(timestamp)),
                    ]),
                    Ok(Update::Connection(state)) if state == connected => continue,
                    Ok(Update::Connection(state)) => {
                        connected = state;
                        HashMap::from([(DataKey::Connection, ChannelValue::Bool(state))])
                    }
                    Err(SubscriberRecvError::Lagged(n)) => {
                        warn!("Channel {} skipped {n} updates", target.address());
                        continue;
                    }
                    Err(_) => break,
                };
                target.send_value(data);
            }
            debug!("Stopped forwarding to channel {}", target.address());
        });

        Ok(ChannelConnection {
            handle,
            channel,
            forwarder,
        })
    }

    pub fn handle(&self) -> &SymbolHandle {
        &self.handle
    }

    /// Handle data written by the host: a [`DataKey::Value`] is written to the PLC
    pub async fn receive_value(&self, data: ChannelData) -> Result<(), ClientError> {
        let Some(ChannelValue::Value(value)) = data.get(&DataKey::Value) else {
            return Ok(());
        };
        debug!("Writing {value} to {}", self.channel.address());
        self.handle.write(value).await
    }

    /// Stop forwarding, release the symbol and tell the channel it is disconnected
    pub async fn close(self) {
        self.handle.close().await;
        // Closing the handle ends the subscription, and the forwarder with it
        if let Err(e) = self.forwarder.await {
            warn!("Channel forwarder for {} failed: {e}", self.channel.address());
        }
        self.channel
            .send_value(HashMap::from([(DataKey::Connection, ChannelValue::Bool(false))]));
    }
}
