//! AMS/TCP framing and the ADS command payloads carried inside it.
//!
//! Every message on the wire is an AMS/TCP header (2 reserved bytes and a
//! 32-bit length), a 32-byte [`AmsHeader`] addressing the target and source
//! AMS endpoints, and a command-specific payload. All integers are little
//! endian.
//!
//! Payload structures implement [`AmsMessage`] so they can be parsed from and
//! written to byte buffers symmetrically. [`AmsCodec`] is a
//! [`tokio_util::codec::Decoder`] that cuts a byte stream into [`Frame`]s.

use bytes::BytesMut;
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{le_u8, le_u16, le_u32, le_u64},
};
use std::{
    fmt,
    io::{self, Write},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::{address::AmsNetId, utils::filetime_to_system_time};

pub const AMS_TCP_HEADER_SIZE: usize = 6;
pub const AMS_HEADER_SIZE: usize = 32;
/// Largest frame we will buffer. Symbol tables of big projects are several MB.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// State flags marking an ADS command as request or response
pub const STATE_REQUEST: u16 = 0x0004;
pub const STATE_RESPONSE: u16 = 0x0005;

/// Symbol not found on the PLC
pub const ADS_ERROR_SYMBOL_NOT_FOUND: u32 = 0x710;

/// A basic trait to tie nom parseability to the struct without a
/// plethora of named functions.
/// Also adds common interface for writing a message struct to a writer.
pub trait AmsMessage {
    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized;

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}
impl<T> AsBytes for T
where
    T: AmsMessage,
{
    fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // Writing into a Vec does not fail
        let _ = self.write(&mut buffer);
        buffer
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// ADS command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    ReadDeviceInfo = 1,
    Read = 2,
    Write = 3,
    ReadState = 4,
    WriteControl = 5,
    AddDeviceNotification = 6,
    DeleteDeviceNotification = 7,
    DeviceNotification = 8,
    ReadWrite = 9,
}

impl TryFrom<u16> for CommandId {
    type Error = MessageError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => CommandId::ReadDeviceInfo,
            2 => CommandId::Read,
            3 => CommandId::Write,
            4 => CommandId::ReadState,
            5 => CommandId::WriteControl,
            6 => CommandId::AddDeviceNotification,
            7 => CommandId::DeleteDeviceNotification,
            8 => CommandId::DeviceNotification,
            9 => CommandId::ReadWrite,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }
}

/// One end of an AMS route: a net id and an AMS port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AmsAddress {
    pub net_id: AmsNetId,
    pub port: u16,
}

impl AmsAddress {
    pub fn new(net_id: AmsNetId, port: u16) -> Self {
        AmsAddress { net_id, port }
    }
}

impl fmt::Display for AmsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

fn parse_net_id(input: &[u8]) -> IResult<&[u8], AmsNetId> {
    let (input, raw) = take(6usize)(input)?;
    let mut octets = [0u8; 6];
    octets.copy_from_slice(raw);
    Ok((input, AmsNetId(octets)))
}

fn parse_ams_address(input: &[u8]) -> IResult<&[u8], AmsAddress> {
    let (input, net_id) = parse_net_id(input)?;
    let (input, port) = le_u16(input)?;
    Ok((input, AmsAddress { net_id, port }))
}

/// The fixed 32-byte header in front of every ADS command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsHeader {
    pub target: AmsAddress,
    pub source: AmsAddress,
    /// Raw command id. Kept raw so that unknown commands can be skipped.
    pub command: u16,
    pub state_flags: u16,
    pub data_length: u32,
    pub error_code: u32,
    pub invoke_id: u32,
}

impl AmsHeader {
    pub fn command_id(&self) -> Result<CommandId, MessageError> {
        CommandId::try_from(self.command)
    }
    pub fn is_response(&self) -> bool {
        self.state_flags & 0x0001 != 0
    }
}

impl AmsMessage for AmsHeader {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, target) = parse_ams_address(input)?;
        let (input, source) = parse_ams_address(input)?;
        let (input, command) = le_u16(input)?;
        let (input, state_flags) = le_u16(input)?;
        let (input, data_length) = le_u32(input)?;
        let (input, error_code) = le_u32(input)?;
        let (input, invoke_id) = le_u32(input)?;
        Ok((
            input,
            AmsHeader {
                target,
                source,
                command,
                state_flags,
                data_length,
                error_code,
                invoke_id,
            },
        ))
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.target.net_id.octets())?;
        writer.write_all(&self.target.port.to_le_bytes())?;
        writer.write_all(&self.source.net_id.octets())?;
        writer.write_all(&self.source.port.to_le_bytes())?;
        writer.write_all(&self.command.to_le_bytes())?;
        writer.write_all(&self.state_flags.to_le_bytes())?;
        writer.write_all(&self.data_length.to_le_bytes())?;
        writer.write_all(&self.error_code.to_le_bytes())?;
        writer.write_all(&self.invoke_id.to_le_bytes())?;
        Ok(())
    }
}

/// A complete AMS/TCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: AmsHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame around a command payload
    pub fn request(target: AmsAddress, source: AmsAddress, invoke_id: u32, request: &Request) -> Self {
        let payload = request.as_bytes();
        Frame {
            header: AmsHeader {
                target,
                source,
                command: request.command() as u16,
                state_flags: STATE_REQUEST,
                data_length: payload.len() as u32,
                error_code: 0,
                invoke_id,
            },
            payload,
        }
    }

    /// Build the reply to a request frame, swapping the route around
    pub fn reply_to(request: &AmsHeader, response: &Response) -> Self {
        let payload = response.as_bytes();
        Frame {
            header: AmsHeader {
                target: request.source,
                source: request.target,
                command: request.command,
                state_flags: STATE_RESPONSE,
                data_length: payload.len() as u32,
                error_code: 0,
                invoke_id: request.invoke_id,
            },
            payload,
        }
    }
}

impl AmsMessage for Frame {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _reserved) = le_u16(input)?;
        let (input, length) = le_u32(input)?;
        let (input, body) = take(length)(input)?;
        let (body, header) = AmsHeader::parse(body)?;
        // Trust the AMS header over the TCP length for the payload extent
        let (_, payload) = take(header.data_length)(body)?;
        Ok((
            input,
            Frame {
                header,
                payload: payload.to_vec(),
            },
        ))
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let length = (AMS_HEADER_SIZE + self.payload.len()) as u32;
        writer.write_all(&0u16.to_le_bytes())?;
        writer.write_all(&length.to_le_bytes())?;
        AmsHeader {
            data_length: self.payload.len() as u32,
            ..self.header
        }
        .write(writer)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }
}

/// Splits an AMS/TCP byte stream into [`Frame`]s
#[derive(Debug, Default)]
pub struct AmsCodec;

impl Decoder for AmsCodec {
    type Item = Frame;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < AMS_TCP_HEADER_SIZE {
            return Ok(None);
        }
        let length = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if !(AMS_HEADER_SIZE..=MAX_FRAME_SIZE).contains(&length) {
            return Err(MessageError::InvalidField(
                "AMS/TCP length".to_string(),
                length.to_string(),
            ));
        }
        let frame_size = AMS_TCP_HEADER_SIZE + length;
        if src.len() < frame_size {
            src.reserve(frame_size - src.len());
            return Ok(None);
        }
        let data = src.split_to(frame_size);
        let (_, frame) = Frame::parse(&data)?;
        Ok(Some(frame))
    }
}

/// How the PLC decides when to send a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionMode {
    /// Send every cycle
    ServerCycle = 3,
    /// Send when the value changed, checked every cycle
    ServerOnChange = 4,
}

/// Parameters of a device notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationAttributes {
    pub length: u32,
    pub mode: TransmissionMode,
    pub max_delay: Duration,
    pub cycle_time: Duration,
}

impl NotificationAttributes {
    /// On-change notification of `length` bytes, checked every PLC cycle
    pub fn on_change(length: u32) -> Self {
        NotificationAttributes {
            length,
            mode: TransmissionMode::ServerOnChange,
            max_delay: Duration::ZERO,
            cycle_time: Duration::ZERO,
        }
    }
}

/// ADS times are given in units of 100ns
fn to_ads_time(duration: Duration) -> u32 {
    (duration.as_nanos() / 100).min(u32::MAX as u128) as u32
}

/// Read `length` bytes at an index group/offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub index_group: u32,
    pub index_offset: u32,
    pub length: u32,
}

/// Write data at an index group/offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub index_group: u32,
    pub index_offset: u32,
    pub data: Vec<u8>,
}

/// Write data, then read up to `read_length` bytes back, in one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWriteRequest {
    pub index_group: u32,
    pub index_offset: u32,
    pub read_length: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNotificationRequest {
    pub index_group: u32,
    pub index_offset: u32,
    pub attributes: NotificationAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteNotificationRequest {
    pub handle: u32,
}

impl AmsMessage for ReadRequest {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, index_group) = le_u32(input)?;
        let (input, index_offset) = le_u32(input)?;
        let (input, length) = le_u32(input)?;
        Ok((
            input,
            ReadRequest {
                index_group,
                index_offset,
                length,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.index_group.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.length.to_le_bytes())?;
        Ok(())
    }
}

impl AmsMessage for WriteRequest {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, index_group) = le_u32(input)?;
        let (input, index_offset) = le_u32(input)?;
        let (input, length) = le_u32(input)?;
        let (input, data) = take(length)(input)?;
        Ok((
            input,
            WriteRequest {
                index_group,
                index_offset,
                data: data.to_vec(),
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.index_group.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&(self.data.len() as u32).to_le_bytes())?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl AmsMessage for ReadWriteRequest {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, index_group) = le_u32(input)?;
        let (input, index_offset) = le_u32(input)?;
        let (input, read_length) = le_u32(input)?;
        let (input, write_length) = le_u32(input)?;
        let (input, data) = take(write_length)(input)?;
        Ok((
            input,
            ReadWriteRequest {
                index_group,
                index_offset,
                read_length,
                data: data.to_vec(),
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.index_group.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.read_length.to_le_bytes())?;
        writer.write_all(&(self.data.len() as u32).to_le_bytes())?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl AmsMessage for AddNotificationRequest {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, index_group) = le_u32(input)?;
        let (input, index_offset) = le_u32(input)?;
        let (input, length) = le_u32(input)?;
        let (input, mode) = le_u32(input)?;
        let (input, max_delay) = le_u32(input)?;
        let (input, cycle_time) = le_u32(input)?;
        let (input, _reserved) = take(16usize)(input)?;
        let mode = if mode == TransmissionMode::ServerCycle as u32 {
            TransmissionMode::ServerCycle
        } else {
            TransmissionMode::ServerOnChange
        };
        Ok((
            input,
            AddNotificationRequest {
                index_group,
                index_offset,
                attributes: NotificationAttributes {
                    length,
                    mode,
                    max_delay: Duration::from_nanos(max_delay as u64 * 100),
                    cycle_time: Duration::from_nanos(cycle_time as u64 * 100),
                },
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.index_group.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.attributes.length.to_le_bytes())?;
        writer.write_all(&(self.attributes.mode as u32).to_le_bytes())?;
        writer.write_all(&to_ads_time(self.attributes.max_delay).to_le_bytes())?;
        writer.write_all(&to_ads_time(self.attributes.cycle_time).to_le_bytes())?;
        writer.write_all(&[0u8; 16])?;
        Ok(())
    }
}

impl AmsMessage for DeleteNotificationRequest {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, handle) = le_u32(input)?;
        Ok((input, DeleteNotificationRequest { handle }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.handle.to_le_bytes())
    }
}

/// A command sent from client to PLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadDeviceInfo,
    Read(ReadRequest),
    Write(WriteRequest),
    ReadState,
    AddNotification(AddNotificationRequest),
    DeleteNotification(DeleteNotificationRequest),
    ReadWrite(ReadWriteRequest),
}

impl Request {
    pub fn command(&self) -> CommandId {
        match self {
            Request::ReadDeviceInfo => CommandId::ReadDeviceInfo,
            Request::Read(_) => CommandId::Read,
            Request::Write(_) => CommandId::Write,
            Request::ReadState => CommandId::ReadState,
            Request::AddNotification(_) => CommandId::AddDeviceNotification,
            Request::DeleteNotification(_) => CommandId::DeleteDeviceNotification,
            Request::ReadWrite(_) => CommandId::ReadWrite,
        }
    }

    /// Parse the payload of a request frame
    pub fn parse_payload(command: CommandId, payload: &[u8]) -> Result<Self, MessageError> {
        Ok(match command {
            CommandId::ReadDeviceInfo => Request::ReadDeviceInfo,
            CommandId::ReadState => Request::ReadState,
            CommandId::Read => Request::Read(ReadRequest::parse(payload)?.1),
            CommandId::Write => Request::Write(WriteRequest::parse(payload)?.1),
            CommandId::ReadWrite => Request::ReadWrite(ReadWriteRequest::parse(payload)?.1),
            CommandId::AddDeviceNotification => {
                Request::AddNotification(AddNotificationRequest::parse(payload)?.1)
            }
            CommandId::DeleteDeviceNotification => {
                Request::DeleteNotification(DeleteNotificationRequest::parse(payload)?.1)
            }
            other => return Err(MessageError::UnknownCommandId(other as u16)),
        })
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Request::ReadDeviceInfo | Request::ReadState => Ok(()),
            Request::Read(msg) => msg.write(writer),
            Request::Write(msg) => msg.write(writer),
            Request::ReadWrite(msg) => msg.write(writer),
            Request::AddNotification(msg) => msg.write(writer),
            Request::DeleteNotification(msg) => msg.write(writer),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let _ = self.write(&mut buffer);
        buffer
    }
}

/// Reply to Read and ReadWrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub result: u32,
    pub data: Vec<u8>,
}

/// Reply carrying only a result code: Write, WriteControl, DeleteNotification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultResponse {
    pub result: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStateResponse {
    pub result: u32,
    pub ads_state: u16,
    pub device_state: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoResponse {
    pub result: u32,
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNotificationResponse {
    pub result: u32,
    pub handle: u32,
}

impl AmsMessage for ReadResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, result) = le_u32(input)?;
        // Failed reads may not carry a length
        if result != 0 && input.len() < 4 {
            return Ok((
                input,
                ReadResponse {
                    result,
                    data: Vec::new(),
                },
            ));
        }
        let (input, length) = le_u32(input)?;
        let (input, data) = take(length)(input)?;
        Ok((
            input,
            ReadResponse {
                result,
                data: data.to_vec(),
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.result.to_le_bytes())?;
        writer.write_all(&(self.data.len() as u32).to_le_bytes())?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl AmsMessage for ResultResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, result) = le_u32(input)?;
        Ok((input, ResultResponse { result }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.result.to_le_bytes())
    }
}

impl AmsMessage for ReadStateResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, result) = le_u32(input)?;
        let (input, ads_state) = le_u16(input)?;
        let (input, device_state) = le_u16(input)?;
        Ok((
            input,
            ReadStateResponse {
                result,
                ads_state,
                device_state,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.result.to_le_bytes())?;
        writer.write_all(&self.ads_state.to_le_bytes())?;
        writer.write_all(&self.device_state.to_le_bytes())?;
        Ok(())
    }
}

fn padded_string(length: usize) -> impl for<'a> FnMut(&'a [u8]) -> IResult<&'a [u8], String> {
    move |input| {
        let (input, raw_string) = take(length)(input)?;
        let strlen = raw_string.iter().position(|&c| c == 0x00).unwrap_or(length);
        Ok((
            input,
            String::from_utf8_lossy(&raw_string[0..strlen]).into_owned(),
        ))
    }
}

impl AmsMessage for DeviceInfoResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, result) = le_u32(input)?;
        let (input, major) = le_u8(input)?;
        let (input, minor) = le_u8(input)?;
        let (input, build) = le_u16(input)?;
        let (input, name) = padded_string(16)(input)?;
        Ok((
            input,
            DeviceInfoResponse {
                result,
                major,
                minor,
                build,
                name,
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.result.to_le_bytes())?;
        writer.write_all(&[self.major, self.minor])?;
        writer.write_all(&self.build.to_le_bytes())?;
        let mut name = self.name.as_bytes().to_vec();
        name.resize(16, 0);
        writer.write_all(&name)?;
        Ok(())
    }
}

impl AmsMessage for AddNotificationResponse {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, result) = le_u32(input)?;
        if result != 0 && input.len() < 4 {
            return Ok((input, AddNotificationResponse { result, handle: 0 }));
        }
        let (input, handle) = le_u32(input)?;
        Ok((input, AddNotificationResponse { result, handle }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.result.to_le_bytes())?;
        writer.write_all(&self.handle.to_le_bytes())?;
        Ok(())
    }
}

/// A reply from the PLC to one [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    DeviceInfo(DeviceInfoResponse),
    Read(ReadResponse),
    Write(ResultResponse),
    ReadState(ReadStateResponse),
    AddNotification(AddNotificationResponse),
    DeleteNotification(ResultResponse),
    ReadWrite(ReadResponse),
}

impl Response {
    pub fn parse_payload(command: CommandId, payload: &[u8]) -> Result<Self, MessageError> {
        Ok(match command {
            CommandId::ReadDeviceInfo => Response::DeviceInfo(DeviceInfoResponse::parse(payload)?.1),
            CommandId::Read => Response::Read(ReadResponse::parse(payload)?.1),
            CommandId::Write | CommandId::WriteControl => {
                Response::Write(ResultResponse::parse(payload)?.1)
            }
            CommandId::ReadState => Response::ReadState(ReadStateResponse::parse(payload)?.1),
            CommandId::AddDeviceNotification => {
                Response::AddNotification(AddNotificationResponse::parse(payload)?.1)
            }
            CommandId::DeleteDeviceNotification => {
                Response::DeleteNotification(ResultResponse::parse(payload)?.1)
            }
            CommandId::ReadWrite => Response::ReadWrite(ReadResponse::parse(payload)?.1),
            CommandId::DeviceNotification => {
                return Err(MessageError::UnknownCommandId(command as u16));
            }
        })
    }

    /// The ADS return code carried by the response, 0 on success
    pub fn result(&self) -> u32 {
        match self {
            Response::DeviceInfo(r) => r.result,
            Response::Read(r) | Response::ReadWrite(r) => r.result,
            Response::Write(r) | Response::DeleteNotification(r) => r.result,
            Response::ReadState(r) => r.result,
            Response::AddNotification(r) => r.result,
        }
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Response::DeviceInfo(msg) => msg.write(writer),
            Response::Read(msg) | Response::ReadWrite(msg) => msg.write(writer),
            Response::Write(msg) | Response::DeleteNotification(msg) => msg.write(writer),
            Response::ReadState(msg) => msg.write(writer),
            Response::AddNotification(msg) => msg.write(writer),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let _ = self.write(&mut buffer);
        buffer
    }
}

/// One value sample inside a device notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub handle: u32,
    pub data: Vec<u8>,
}

/// A group of samples sharing one PLC timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// Windows FILETIME: 100ns ticks since 1601-01-01
    pub filetime: u64,
    pub samples: Vec<Sample>,
}

impl Stamp {
    pub fn timestamp(&self) -> SystemTime {
        filetime_to_system_time(self.filetime)
    }
}

/// Pushed by the PLC whenever notified values change
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceNotification {
    pub stamps: Vec<Stamp>,
}

impl AmsMessage for Sample {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, handle) = le_u32(input)?;
        let (input, size) = le_u32(input)?;
        let (input, data) = take(size)(input)?;
        Ok((
            input,
            Sample {
                handle,
                data: data.to_vec(),
            },
        ))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.handle.to_le_bytes())?;
        writer.write_all(&(self.data.len() as u32).to_le_bytes())?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl AmsMessage for Stamp {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, filetime) = le_u64(input)?;
        let (input, sample_count) = le_u32(input)?;
        let (input, samples) = count(Sample::parse, sample_count as usize).parse(input)?;
        Ok((input, Stamp { filetime, samples }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.filetime.to_le_bytes())?;
        writer.write_all(&(self.samples.len() as u32).to_le_bytes())?;
        for sample in &self.samples {
            sample.write(writer)?;
        }
        Ok(())
    }
}

impl AmsMessage for DeviceNotification {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, length) = le_u32(input)?;
        let (input, body) = take(length)(input)?;
        let (body, stamp_count) = le_u32(body)?;
        let (_, stamps) = count(Stamp::parse, stamp_count as usize).parse(body)?;
        Ok((input, DeviceNotification { stamps }))
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut body = Vec::new();
        body.write_all(&(self.stamps.len() as u32).to_le_bytes())?;
        for stamp in &self.stamps {
            stamp.write(&mut body)?;
        }
        writer.write_all(&(body.len() as u32).to_le_bytes())?;
        writer.write_all(&body)?;
        Ok(())
    }
}

/// Run states reported by ReadState
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsState {
    Invalid = 0,
    Idle = 1,
    Reset = 2,
    Init = 3,
    Start = 4,
    Run = 5,
    Stop = 6,
    SaveConfig = 7,
    LoadConfig = 8,
    PowerFailure = 9,
    PowerGood = 10,
    Error = 11,
    Shutdown = 12,
    Suspend = 13,
    Resume = 14,
    Config = 15,
    Reconfig = 16,
}

impl From<u16> for AdsState {
    fn from(value: u16) -> Self {
        match value {
            1 => AdsState::Idle,
            2 => AdsState::Reset,
            3 => AdsState::Init,
            4 => AdsState::Start,
            5 => AdsState::Run,
            6 => AdsState::Stop,
            7 => AdsState::SaveConfig,
            8 => AdsState::LoadConfig,
            9 => AdsState::PowerFailure,
            10 => AdsState::PowerGood,
            11 => AdsState::Error,
            12 => AdsState::Shutdown,
            13 => AdsState::Suspend,
            14 => AdsState::Resume,
            15 => AdsState::Config,
            16 => AdsState::Reconfig,
            _ => AdsState::Invalid,
        }
    }
}

/// Human readable description of an ADS return code
pub fn error_description(code: u32) -> &'static str {
    match code {
        0x000 => "No error",
        0x001 => "Internal error",
        0x002 => "No real-time",
        0x003 => "Allocation locked - memory error",
        0x004 => "Mailbox full - the ADS message could not be sent",
        0x005 => "Wrong receive HMSG",
        0x006 => "Target port not found, possibly the ADS server is not started",
        0x007 => "Target computer not found, possibly the ADS route was not found",
        0x008 => "Unknown command ID",
        0x009 => "Invalid task ID",
        0x00A => "No IO",
        0x00B => "Unknown AMS command",
        0x00C => "Win32 error",
        0x00D => "Port not connected",
        0x00E => "Invalid AMS length",
        0x00F => "Invalid AMS Net ID",
        0x012 => "Port disabled",
        0x013 => "Port already connected",
        0x018 => "Invalid AMS port",
        0x700 => "General device error",
        0x701 => "Service is not supported by server",
        0x702 => "Invalid index group",
        0x703 => "Invalid index offset",
        0x704 => "Reading/writing not permitted",
        0x705 => "Parameter size not correct",
        0x706 => "Invalid parameter value(s)",
        0x707 => "Device is not in a ready state",
        0x708 => "Device is busy",
        0x709 => "Invalid context (must be in Windows)",
        0x70A => "Out of memory",
        0x70B => "Invalid parameter value(s)",
        0x70C => "Not found (files, ...)",
        0x70D => "Syntax error in command or file",
        0x70E => "Objects do not match",
        0x70F => "Object already exists",
        0x710 => "Symbol not found",
        0x711 => "Symbol version invalid, possibly caused by an 'online change'",
        0x712 => "Server is in an invalid state",
        0x713 => "AdsTransMode is not supported",
        0x714 => "Notification handle is invalid",
        0x715 => "Notification client not registered",
        0x716 => "No more notification handles",
        0x717 => "Notification size too large",
        0x718 => "Device not initialized",
        0x719 => "Device has a timeout",
        0x71A => "Query interface failed",
        0x71B => "Wrong interface required",
        0x71C => "Class ID is invalid",
        0x71D => "Object ID is invalid",
        0x71E => "Request is pending",
        0x71F => "Request is aborted",
        0x720 => "Signal warning",
        0x721 => "Invalid array index",
        0x722 => "Symbol not active",
        0x723 => "Access denied",
        0x724 => "Missing license",
        0x725 => "License expired",
        0x726 => "License exceeded",
        0x727 => "License invalid",
        0x740 => "General client error",
        0x741 => "Invalid parameter at service",
        0x742 => "Polling list is empty",
        0x743 => "Var connection already in use",
        0x744 => "Invoke ID in use",
        0x745 => "Timeout elapsed",
        0x746 => "Error in Win32 subsystem",
        0x747 => "Invalid client timeout value",
        0x748 => "ADS port not opened",
        0x750 => "Internal error in ADS sync",
        0x751 => "Hash table overflow",
        0x752 => "Key not found in hash",
        0x753 => "No more symbols in cache",
        0x754 => "Invalid response received",
        0x755 => "Sync port is locked",
        _ => "Unknown ADS error",
    }
}
