#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use adsars::{
    ClientConfig, ConnectionRegistry, TargetDescriptor,
    messages::{
        AddNotificationResponse, AdsState, AmsCodec, AmsHeader, AsBytes, CommandId,
        DeviceInfoResponse, DeviceNotification, Frame, ReadResponse, ReadStateResponse, Request,
        Response, ResultResponse, STATE_REQUEST, Sample, Stamp,
    },
    symbols::SymbolEntry,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

const SYMBOL_GROUP: u32 = 0x4020;
const SYMBOL_NOT_FOUND: u32 = 0x710;
const INVALID_OFFSET: u32 = 0x703;
const INVALID_HANDLE: u32 = 0x714;

struct Watcher {
    index_offset: u32,
    /// Header of the request that added the notification
    request: AmsHeader,
    connection: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct PlcState {
    symbols: Vec<SymbolEntry>,
    /// Memory of each symbol, keyed by index offset
    memory: HashMap<u32, Vec<u8>>,
    notifications: HashMap<u32, Watcher>,
    next_handle: u32,
    next_offset: u32,
    /// Offsets that never answer reads
    hanging: Vec<u32>,
    connections: usize,
    connections_total: usize,
    reads: HashMap<u32, usize>,
    /// Symbol lookups by name
    lookups: usize,
    /// Notifications deleted on request
    deleted: usize,
    /// Answer the next AddNotification only after this long
    notification_delay: Option<Duration>,
}

/// An in-process PLC speaking just enough ADS for the client
#[derive(Clone)]
pub struct FakePlc {
    address: SocketAddr,
    state: Arc<Mutex<PlcState>>,
    /// Cancelling this drops every open connection
    connections: Arc<Mutex<CancellationToken>>,
    stop: CancellationToken,
}

impl FakePlc {
    pub async fn start() -> FakePlc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let plc = FakePlc {
            address: listener.local_addr().unwrap(),
            state: Default::default(),
            connections: Arc::new(Mutex::new(CancellationToken::new())),
            stop: CancellationToken::new(),
        };
        info!("Fake PLC listening on {}", plc.address);
        let server = plc.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = select! {
                    _ = server.stop.cancelled() => break,
                    accepted = listener.accept() => accepted.unwrap(),
                };
                debug!("Fake PLC accepted connection from {peer}");
                let cancel = server.connections.lock().unwrap().child_token();
                tokio::spawn(server.clone().serve(stream, cancel));
            }
        });
        plc
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn target(&self) -> TargetDescriptor {
        TargetDescriptor::from_ip("127.0.0.1".parse().unwrap())
    }

    /// The address of a symbol on this PLC
    pub fn address(&self, symbol: &str) -> String {
        format!("ads://127.0.0.1/{symbol}")
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new()
            .tcp_port(self.port())
            .timeout(Duration::from_millis(500))
            .retry_interval(Duration::from_millis(50))
    }

    pub fn registry(&self) -> ConnectionRegistry {
        ConnectionRegistry::with_config(self.config())
    }

    pub fn add_symbol(&self, name: &str, type_name: &str, data_type: u32, value: &[u8]) {
        self.add_symbol_with_flags(name, type_name, data_type, value, 0x8);
    }

    pub fn add_symbol_with_flags(
        &self,
        name: &str,
        type_name: &str,
        data_type: u32,
        value: &[u8],
        flags: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let offset = state.next_offset;
        state.next_offset += 0x100;
        state.symbols.push(SymbolEntry {
            index_group: SYMBOL_GROUP,
            index_offset: offset,
            size: value.len() as u32,
            data_type,
            flags,
            name: name.to_string(),
            type_name: type_name.to_string(),
            comment: format!("Test symbol {name}"),
        });
        state.memory.insert(offset, value.to_vec());
    }

    fn offset_of(&self, name: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.index_offset)
            .unwrap()
    }

    /// Change a value from the PLC side, notifying any watchers
    pub fn set_value(&self, name: &str, value: &[u8]) {
        let offset = self.offset_of(name);
        let mut state = self.state.lock().unwrap();
        state.memory.insert(offset, value.to_vec());
        notify(&state, offset, value);
    }

    pub fn value(&self, name: &str) -> Vec<u8> {
        let offset = self.offset_of(name);
        self.state.lock().unwrap().memory[&offset].clone()
    }

    /// Never answer reads of this symbol
    pub fn hang_reads(&self, name: &str) {
        let offset = self.offset_of(name);
        self.state.lock().unwrap().hanging.push(offset);
    }

    /// Answer reads of this symbol again
    pub fn resume_reads(&self, name: &str) {
        let offset = self.offset_of(name);
        self.state.lock().unwrap().hanging.retain(|o| *o != offset);
    }

    /// Delay the answer to the next AddNotification request
    pub fn delay_next_notification(&self, delay: Duration) {
        self.state.lock().unwrap().notification_delay = Some(delay);
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().unwrap().lookups
    }

    pub fn deleted_notifications(&self) -> usize {
        self.state.lock().unwrap().deleted
    }

    pub fn reads(&self, name: &str) -> usize {
        let offset = self.offset_of(name);
        *self.state.lock().unwrap().reads.get(&offset).unwrap_or(&0)
    }

    pub fn notification_count(&self) -> usize {
        self.state.lock().unwrap().notifications.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn total_connections(&self) -> usize {
        self.state.lock().unwrap().connections_total
    }

    /// Drop every client connection, as if the PLC restarted
    pub fn drop_connections(&self) {
        let mut token = self.connections.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
        self.state.lock().unwrap().notifications.clear();
    }

    /// Wait until a condition on the PLC becomes true
    pub async fn wait_for(&self, what: &str, condition: impl Fn(&FakePlc) -> bool) {
        for _ in 0..200 {
            if condition(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Timed out waiting for {what}");
    }

    async fn serve(self, stream: TcpStream, cancel: CancellationToken) {
        {
            let mut state = self.state.lock().unwrap();
            state.connections += 1;
            state.connections_total += 1;
        }
        let (rx, mut tx) = stream.into_split();
        let mut frames = FramedRead::new(rx, AmsCodec);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        loop {
            select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        if frame.header.state_flags != STATE_REQUEST {
                            continue;
                        }
                        self.handle(frame, &out_tx);
                    }
                    _ => break,
                },
                Some(frame) = out_rx.recv() => {
                    if tx.write_all(&frame.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
        let mut state = self.state.lock().unwrap();
        state.connections -= 1;
        state
            .notifications
            .retain(|_, watcher| !watcher.connection.same_channel(&out_tx));
    }

    fn handle(&self, frame: Frame, out: &mpsc::UnboundedSender<Frame>) {
        let command = frame.header.command_id().unwrap();
        let request = Request::parse_payload(command, &frame.payload).unwrap();
        let mut state = self.state.lock().unwrap();
        let read = |result: u32, data: Vec<u8>| ReadResponse { result, data };
        let response = match request {
            Request::ReadDeviceInfo => Response::DeviceInfo(DeviceInfoResponse {
                result: 0,
                major: 3,
                minor: 1,
                build: 4024,
                name: "Fake PLC".to_string(),
            }),
            Request::ReadState => Response::ReadState(ReadStateResponse {
                result: 0,
                ads_state: AdsState::Run as u16,
                device_state: 0,
            }),
            Request::ReadWrite(request) if request.index_group == 0xF009 => {
                let name = String::from_utf8_lossy(&request.data)
                    .trim_end_matches('\0')
                    .to_string();
                state.lookups += 1;
                Response::ReadWrite(
                    match state.symbols.iter().find(|s| s.name.eq_ignore_ascii_case(&name)) {
                        Some(symbol) => read(0, symbol.as_bytes()),
                        None => read(SYMBOL_NOT_FOUND, Vec::new()),
                    },
                )
            }
            Request::ReadWrite(_) => Response::ReadWrite(read(0x701, Vec::new())),
            Request::Read(request) if request.index_group == 0xF00C => {
                let table: Vec<u8> = state.symbols.iter().flat_map(|s| s.as_bytes()).collect();
                let mut data = (state.symbols.len() as u32).to_le_bytes().to_vec();
                data.extend((table.len() as u32).to_le_bytes());
                Response::Read(read(0, data))
            }
            Request::Read(request) if request.index_group == 0xF00B => {
                let table: Vec<u8> = state.symbols.iter().flat_map(|s| s.as_bytes()).collect();
                Response::Read(read(0, table))
            }
            Request::Read(request) => {
                if state.hanging.contains(&request.index_offset) {
                    return;
                }
                *state.reads.entry(request.index_offset).or_default() += 1;
                Response::Read(match state.memory.get(&request.index_offset) {
                    Some(value) => {
                        let length = (request.length as usize).min(value.len());
                        read(0, value[..length].to_vec())
                    }
                    None => read(INVALID_OFFSET, Vec::new()),
                })
            }
            Request::Write(request) => {
                let result = match state.memory.get_mut(&request.index_offset) {
                    Some(value) if value.len() == request.data.len() => {
                        value.copy_from_slice(&request.data);
                        0
                    }
                    Some(_) => 0x705,
                    None => INVALID_OFFSET,
                };
                if result == 0 {
                    notify(&state, request.index_offset, &request.data);
                }
                Response::Write(ResultResponse { result })
            }
            Request::AddNotification(request) => {
                let handle = state.next_handle + 1;
                state.next_handle = handle;
                state.notifications.insert(
                    handle,
                    Watcher {
                        index_offset: request.index_offset,
                        request: frame.header,
                        connection: out.clone(),
                    },
                );
                let mut frames = vec![Frame::reply_to(
                    &frame.header,
                    &Response::AddNotification(AddNotificationResponse { result: 0, handle }),
                )];
                // On-change notifications start with the current value
                if let Some(value) = state.memory.get(&request.index_offset) {
                    frames.push(notification_frame(&frame.header, handle, value));
                }
                match state.notification_delay.take() {
                    Some(delay) => {
                        let out = out.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            for frame in frames {
                                let _ = out.send(frame);
                            }
                        });
                    }
                    None => {
                        for frame in frames {
                            let _ = out.send(frame);
                        }
                    }
                }
                return;
            }
            Request::DeleteNotification(request) => {
                let result = match state.notifications.remove(&request.handle) {
                    Some(_) => {
                        state.deleted += 1;
                        0
                    }
                    None => INVALID_HANDLE,
                };
                Response::DeleteNotification(ResultResponse { result })
            }
        };
        let _ = out.send(Frame::reply_to(&frame.header, &response));
    }
}

fn filetime_now() -> u64 {
    let since_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    (since_unix.as_nanos() / 100) as u64 + 116_444_736_000_000_000
}

fn notification_frame(request: &AmsHeader, handle: u32, value: &[u8]) -> Frame {
    let notification = DeviceNotification {
        stamps: vec![Stamp {
            filetime: filetime_now(),
            samples: vec![Sample {
                handle,
                data: value.to_vec(),
            }],
        }],
    };
    let payload = notification.as_bytes();
    Frame {
        header: AmsHeader {
            target: request.source,
            source: request.target,
            command: CommandId::DeviceNotification as u16,
            state_flags: STATE_REQUEST,
            data_length: payload.len() as u32,
            error_code: 0,
            invoke_id: 0,
        },
        payload,
    }
}

fn notify(state: &PlcState, offset: u32, value: &[u8]) {
    for (handle, watcher) in &state.notifications {
        if watcher.index_offset == offset {
            let _ = watcher
                .connection
                .send(notification_frame(&watcher.request, *handle, value));
        }
    }
}
