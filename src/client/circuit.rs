use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant, SystemTime},
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    address::AmsNetId,
    client::TransportError,
    messages::{
        AddNotificationRequest, AmsAddress, AmsCodec, AmsMessage, AsBytes, CommandId,
        DeleteNotificationRequest, DeviceNotification, Frame, MessageError, Request, Response,
    },
    utils::wrapping_inplace_add,
};

/// One value pushed by the PLC for a device notification
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationSample {
    /// PLC time the sample was taken
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

pub(crate) enum CircuitRequest {
    /// Send a request and wait for the matching response
    Call {
        request: Request,
        reply: oneshot::Sender<Result<Response, TransportError>>,
    },
    /// Add a device notification, routing its samples to `samples`
    Subscribe {
        request: AddNotificationRequest,
        samples: mpsc::Sender<NotificationSample>,
        reply: oneshot::Sender<Result<u32, TransportError>>,
    },
}

/// Handle to a task owning one TCP connection to a PLC
///
/// Requests are queued and sent one at a time; the next request is only
/// taken from the queue once the previous one was answered or timed out.
#[derive(Clone)]
pub(crate) struct Circuit {
    address: SocketAddr,
    cancel: CancellationToken,
    requests_tx: mpsc::Sender<CircuitRequest>,
}

impl Circuit {
    pub async fn connect(
        address: SocketAddr,
        target: AmsAddress,
        source_net_id: Option<AmsNetId>,
        source_port: u16,
        timeout: Duration,
        queue_depth: usize,
    ) -> Result<Self, TransportError> {
        debug!("Connecting new Circuit to {address}");
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        tcp.set_nodelay(true)?;

        // Without a configured identity we present the local IP, as a router would
        let source_net_id = match source_net_id {
            Some(net_id) => net_id,
            None => match tcp.local_addr()?.ip() {
                IpAddr::V4(ip) => AmsNetId::from_ip(ip),
                IpAddr::V6(_) => AmsNetId::from_ip(Ipv4Addr::LOCALHOST),
            },
        };
        let source = AmsAddress::new(source_net_id, source_port);
        debug!("Circuit to {address} using source address {source}, target {target}");

        let (requests_tx, requests_rx) = mpsc::channel(queue_depth.max(1));
        let cancel = CancellationToken::new();

        let inner_cancel = cancel.clone();
        tokio::spawn(async move {
            CircuitInternal {
                address,
                target,
                source,
                timeout,
                requests_rx,
                cancel: inner_cancel,
                next_invoke_id: 1,
                pending: None,
                watchers: Default::default(),
                expired_subscriptions: Default::default(),
                cleanup: Default::default(),
            }
            .circuit_lifecycle(tcp)
            .await;
        });

        debug!("Circuit Ready.");
        Ok(Circuit {
            address,
            cancel,
            requests_tx,
        })
    }

    /// True once the connection has been lost or closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close(&self) {
        debug!("Closing circuit to {}", self.address);
        self.cancel.cancel();
    }

    pub async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(CircuitRequest::Call { request, reply: tx })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        rx.await.map_err(|_| TransportError::Disconnected)?
    }

    pub async fn subscribe(
        &self,
        request: AddNotificationRequest,
        samples: mpsc::Sender<NotificationSample>,
    ) -> Result<u32, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(CircuitRequest::Subscribe {
                request,
                samples,
                reply: tx,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        rx.await.map_err(|_| TransportError::Disconnected)?
    }
}

enum PendingReply {
    Call(oneshot::Sender<Result<Response, TransportError>>),
    Subscribe(
        mpsc::Sender<NotificationSample>,
        oneshot::Sender<Result<u32, TransportError>>,
    ),
    /// Sent on our own behalf; nobody waits for the answer
    Discard,
}

/// The single request currently awaiting a response
struct PendingRequest {
    invoke_id: u32,
    command: CommandId,
    deadline: Instant,
    reply: PendingReply,
}

impl PendingRequest {
    fn fail(self, error: TransportError) {
        match self.reply {
            PendingReply::Call(reply) => {
                let _ = reply.send(Err(error));
            }
            PendingReply::Subscribe(_, reply) => {
                let _ = reply.send(Err(error));
            }
            PendingReply::Discard => debug!("Request {} failed: {error}", self.invoke_id),
        }
    }
}

/// Timed out subscriptions remembered in case their answer turns up late
const MAX_EXPIRED_SUBSCRIPTIONS: usize = 64;

// Inner circuit state, owned by the connection task
struct CircuitInternal {
    /// A copy of the address we are connected to
    address: SocketAddr,
    target: AmsAddress,
    source: AmsAddress,
    timeout: Duration,
    requests_rx: mpsc::Receiver<CircuitRequest>,
    cancel: CancellationToken,
    next_invoke_id: u32,
    pending: Option<PendingRequest>,
    /// Notification handle to the consumer of its samples
    watchers: HashMap<u32, mpsc::Sender<NotificationSample>>,
    /// Invoke ids of notification requests that timed out
    expired_subscriptions: VecDeque<u32>,
    /// Requests of our own, sent whenever nothing else is pending
    cleanup: VecDeque<Request>,
}

impl CircuitInternal {
    async fn circuit_lifecycle(&mut self, tcp: TcpStream) {
        debug!("Started circuit to {}", self.address);
        let (tcp_rx, mut tcp_tx) = tcp.into_split();
        let mut framed = FramedRead::with_capacity(tcp_rx, AmsCodec, 16384usize);
        loop {
            // Only used when there is something pending
            let deadline = self
                .pending
                .as_ref()
                .map(|p| p.deadline)
                .unwrap_or_else(|| Instant::now() + self.timeout);
            let cleanup = self
                .pending
                .is_none()
                .then(|| self.cleanup.pop_front())
                .flatten();
            let frame_out = if let Some(request) = cleanup {
                Some(self.start_request(request, PendingReply::Discard))
            } else {
                select! {
                    _ = self.cancel.cancelled() => break,
                    incoming = framed.next() => match incoming {
                        Some(Ok(frame)) => {
                            self.handle_frame(frame);
                            None
                        }
                        Some(Err(e)) => {
                            error!("Got error processing PLC message, dropping connection: {e}");
                            break;
                        }
                        None => {
                            debug!("PLC at {} closed the connection", self.address);
                            break;
                        }
                    },
                    request = self.requests_rx.recv(), if self.pending.is_none() => match request {
                        None => break,
                        Some(req) => Some(self.handle_request(req)),
                    },
                    _ = tokio::time::sleep_until(deadline.into()), if self.pending.is_some() => {
                        if let Some(pending) = self.pending.take() {
                            warn!(
                                "Request {} ({:?}) to {} timed out",
                                pending.invoke_id, pending.command, self.address
                            );
                            if pending.command == CommandId::AddDeviceNotification {
                                self.remember_expired(pending.invoke_id);
                            }
                            pending.fail(TransportError::Timeout(self.timeout));
                        }
                        None
                    },
                }
            };

            if let Some(frame) = frame_out {
                trace!("Sending {:?}", frame.header);
                if let Err(e) = tcp_tx.write_all(&frame.as_bytes()).await {
                    error!("Failed to write message to io stream, aborting: {e}");
                    break;
                }
            }
        }
        self.cancel.cancel();
        if let Some(pending) = self.pending.take() {
            pending.fail(TransportError::Disconnected);
        }
        // Dropping the senders tells every notification consumer we are gone
        self.watchers.clear();
        let _ = tcp_tx.shutdown().await;
        debug!("Circuit to {} terminated", self.address);
    }

    fn remember_expired(&mut self, invoke_id: u32) {
        if self.expired_subscriptions.len() >= MAX_EXPIRED_SUBSCRIPTIONS {
            self.expired_subscriptions.pop_front();
        }
        self.expired_subscriptions.push_back(invoke_id);
    }

    fn handle_request(&mut self, request: CircuitRequest) -> Frame {
        let (request, reply) = match request {
            CircuitRequest::Call { request, reply } => {
                if let Request::DeleteNotification(delete) = &request {
                    self.watchers.remove(&delete.handle);
                }
                (request, PendingReply::Call(reply))
            }
            CircuitRequest::Subscribe {
                request,
                samples,
                reply,
            } => (
                Request::AddNotification(request),
                PendingReply::Subscribe(samples, reply),
            ),
        };
        self.start_request(request, reply)
    }

    /// Make `request` the pending one, returning the frame to send
    fn start_request(&mut self, request: Request, reply: PendingReply) -> Frame {
        let invoke_id = wrapping_inplace_add(&mut self.next_invoke_id);
        let _span = debug_span!("handle_request", invoke_id = invoke_id).entered();
        debug!("Sending {:?} request", request.command());
        self.pending = Some(PendingRequest {
            invoke_id,
            command: request.command(),
            deadline: Instant::now() + self.timeout,
            reply,
        });
        Frame::request(self.target, self.source, invoke_id, &request)
    }

    fn handle_frame(&mut self, frame: Frame) {
        trace!("Received frame: {:?}", frame.header);
        match frame.header.command_id() {
            Ok(CommandId::DeviceNotification) => self.handle_notification(&frame.payload),
            Ok(command) if frame.header.is_response() => self.handle_response(command, frame),
            Ok(_) => warn!("Ignoring request frame sent by PLC: {:?}", frame.header),
            Err(e) => warn!("Ignoring frame from PLC: {e}"),
        }
    }

    fn handle_response(&mut self, command: CommandId, frame: Frame) {
        let invoke_id = frame.header.invoke_id;
        let Some(pending) = self.pending.take_if(|p| p.invoke_id == invoke_id) else {
            self.handle_late_response(command, frame);
            return;
        };
        let _span = debug_span!("handle_response", invoke_id = invoke_id).entered();
        if command != pending.command {
            pending.fail(TransportError::InvalidResponse(MessageError::InvalidField(
                "command".to_string(),
                format!("{command:?}"),
            )));
            return;
        }
        let result = if frame.header.error_code != 0 {
            Err(TransportError::Ads(frame.header.error_code))
        } else {
            match Response::parse_payload(command, &frame.payload) {
                Ok(response) if response.result() != 0 => {
                    Err(TransportError::Ads(response.result()))
                }
                Ok(response) => Ok(response),
                Err(e) => Err(TransportError::InvalidResponse(e)),
            }
        };
        match pending.reply {
            PendingReply::Call(reply) => {
                let _ = reply.send(result);
            }
            PendingReply::Discard => {
                if let Err(e) = result {
                    debug!("Request {invoke_id} failed: {e}");
                }
            }
            PendingReply::Subscribe(samples, reply) => match result {
                Ok(Response::AddNotification(added)) => {
                    debug!("Added notification handle {}", added.handle);
                    // Registered before any further frame is read, so no sample is missed
                    self.watchers.insert(added.handle, samples);
                    let _ = reply.send(Ok(added.handle));
                }
                Ok(other) => {
                    let _ = reply.send(Err(TransportError::InvalidResponse(
                        MessageError::InvalidField("response".to_string(), format!("{other:?}")),
                    )));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
        }
    }

    /// A response nobody waits for any more
    ///
    /// A notification added after its request timed out would never be
    /// deleted by anyone, so we delete it ourselves.
    fn handle_late_response(&mut self, command: CommandId, frame: Frame) {
        let invoke_id = frame.header.invoke_id;
        let Some(position) = self
            .expired_subscriptions
            .iter()
            .position(|id| *id == invoke_id)
        else {
            debug!("Got response for unknown or expired request {invoke_id}");
            return;
        };
        self.expired_subscriptions.remove(position);
        if command != CommandId::AddDeviceNotification || frame.header.error_code != 0 {
            return;
        }
        match Response::parse_payload(command, &frame.payload) {
            Ok(Response::AddNotification(added)) if added.result == 0 => {
                debug!(
                    "Notification handle {} was added after its request {invoke_id} timed out, deleting",
                    added.handle
                );
                self.cleanup
                    .push_back(Request::DeleteNotification(DeleteNotificationRequest {
                        handle: added.handle,
                    }));
            }
            Ok(_) => (),
            Err(e) => warn!("Could not parse late notification response: {e}"),
        }
    }

    fn handle_notification(&mut self, payload: &[u8]) {
        let notification = match DeviceNotification::parse(payload) {
            Ok((_, notification)) => notification,
            Err(e) => {
                warn!("Could not parse device notification: {e}");
                return;
            }
        };
        for stamp in notification.stamps {
            let timestamp = stamp.timestamp();
            for sample in stamp.samples {
                let Some(watcher) = self.watchers.get(&sample.handle) else {
                    trace!("Got sample for unknown notification handle {}", sample.handle);
                    continue;
                };
                match watcher.try_send(NotificationSample {
                    timestamp,
                    data: sample.data,
                }) {
                    Ok(()) => (),
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Consumer of notification {} is lagging, dropping sample",
                            sample.handle
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("No more receivers for notification {}", sample.handle);
                        self.watchers.remove(&sample.handle);
                    }
                }
            }
        }
    }
}
