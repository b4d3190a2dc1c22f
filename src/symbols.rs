//! Symbol metadata: lookup of one symbol by name, and upload of the whole
//! symbol table.
//!
//! Both return symbol entries in the same binary layout:
//!
//! | field          | type  |
//! |----------------|-------|
//! | entry length   | u32   |
//! | index group    | u32   |
//! | index offset   | u32   |
//! | size           | u32   |
//! | data type      | u32   |
//! | flags          | u32   |
//! | name length    | u16   |
//! | type length    | u16   |
//! | comment length | u16   |
//! | name           | NUL terminated |
//! | type name      | NUL terminated |
//! | comment        | NUL terminated |
//!
//! The entry length covers the whole entry including the length field. Newer
//! PLCs append extra data after the comment, so entries are always stepped
//! over by their declared length.

use nom::{
    IResult,
    bytes::complete::take,
    error::{Error, ErrorKind},
    number::complete::{le_u16, le_u32},
};
use std::{
    collections::HashMap,
    io::{self, Write},
};
use tracing::{debug, warn};

use crate::{
    client::{ClientError, Session, TransportError},
    ctype::{TypeRegistry, TypeSpec, resolve_ctype},
    messages::{ADS_ERROR_SYMBOL_NOT_FOUND, AmsMessage},
};

/// Read/write symbol info by name, extended form
pub const ADSIGRP_SYM_INFOBYNAMEEX: u32 = 0xF009;
/// Upload the symbol table
pub const ADSIGRP_SYM_UPLOAD: u32 = 0xF00B;
/// Symbol count and table size
pub const ADSIGRP_SYM_UPLOADINFO: u32 = 0xF00C;

/// Symbol is read only
pub const ADSSYMBOLFLAG_READONLY: u32 = 1 << 5;

/// Fixed part of an entry before the strings
const ENTRY_HEADER_SIZE: usize = 30;
/// Largest symbol info we ask for by name
const MAX_SYMBOL_INFO_SIZE: usize = 0xFFFF;

/// One raw symbol entry, as stored in the PLC symbol table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolEntry {
    pub index_group: u32,
    pub index_offset: u32,
    pub size: u32,
    pub data_type: u32,
    pub flags: u32,
    pub name: String,
    pub type_name: String,
    pub comment: String,
}

fn nul_terminated(length: u16) -> impl for<'a> FnMut(&'a [u8]) -> IResult<&'a [u8], String> {
    move |input| {
        let (input, raw) = take(length)(input)?;
        // Step over the terminator if there is one
        let input = input.get(1..).unwrap_or(input);
        let strlen = raw.iter().position(|&c| c == 0x00).unwrap_or(raw.len());
        Ok((input, String::from_utf8_lossy(&raw[..strlen]).into_owned()))
    }
}

impl AmsMessage for SymbolEntry {
    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (rest, entry_length) = le_u32(input)?;
        if (entry_length as usize) < ENTRY_HEADER_SIZE {
            return Err(nom::Err::Error(Error::new(input, ErrorKind::LengthValue)));
        }
        let (rest, body) = take(entry_length - 4)(rest)?;
        let (body, index_group) = le_u32(body)?;
        let (body, index_offset) = le_u32(body)?;
        let (body, size) = le_u32(body)?;
        let (body, data_type) = le_u32(body)?;
        let (body, flags) = le_u32(body)?;
        let (body, name_length) = le_u16(body)?;
        let (body, type_length) = le_u16(body)?;
        let (body, comment_length) = le_u16(body)?;
        let (body, name) = nul_terminated(name_length)(body)?;
        let (body, type_name) = nul_terminated(type_length)(body)?;
        let (_, comment) = nul_terminated(comment_length)(body)?;
        Ok((
            rest,
            SymbolEntry {
                index_group,
                index_offset,
                size,
                data_type,
                flags,
                name,
                type_name,
                comment,
            },
        ))
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let entry_length = ENTRY_HEADER_SIZE
            + self.name.len()
            + 1
            + self.type_name.len()
            + 1
            + self.comment.len()
            + 1;
        writer.write_all(&(entry_length as u32).to_le_bytes())?;
        writer.write_all(&self.index_group.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        writer.write_all(&self.data_type.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&(self.name.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.type_name.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.comment.len() as u16).to_le_bytes())?;
        for text in [&self.name, &self.type_name, &self.comment] {
            writer.write_all(text.as_bytes())?;
            writer.write_all(&[0u8])?;
        }
        Ok(())
    }
}

/// A resolved symbol: where it lives and how to decode it
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub name: String,
    pub index_group: u32,
    pub index_offset: u32,
    pub size: u32,
    pub flags: u32,
    pub type_spec: TypeSpec,
}

impl SymbolInfo {
    pub fn is_read_only(&self) -> bool {
        self.flags & ADSSYMBOLFLAG_READONLY != 0
    }
}

/// Look up one symbol by name, and build its decode plan
pub async fn resolve(
    session: &Session,
    symbol_path: &str,
    overrides: &TypeRegistry,
) -> Result<SymbolInfo, ClientError> {
    let mut request = symbol_path.as_bytes().to_vec();
    request.push(0);
    let data = match session
        .read_write(ADSIGRP_SYM_INFOBYNAMEEX, 0, MAX_SYMBOL_INFO_SIZE, &request)
        .await
    {
        Ok(data) => data,
        Err(TransportError::Ads(ADS_ERROR_SYMBOL_NOT_FOUND)) => {
            return Err(ClientError::SymbolNotFound(symbol_path.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let entry = match SymbolEntry::parse(&data) {
        Ok((_, entry)) if !entry.name.is_empty() => entry,
        _ => {
            debug!(
                "Symbol info for {symbol_path} was empty or short ({} bytes)",
                data.len()
            );
            return Err(ClientError::SymbolNotFound(symbol_path.to_string()));
        }
    };
    let type_spec = resolve_ctype(
        entry.data_type,
        &entry.type_name,
        entry.size as usize,
        &entry.comment,
        overrides,
    )?;
    debug!(
        "Resolved {symbol_path}: {} at {:#x}:{:#x}",
        entry.type_name, entry.index_group, entry.index_offset
    );
    Ok(SymbolInfo {
        name: entry.name,
        index_group: entry.index_group,
        index_offset: entry.index_offset,
        size: entry.size,
        flags: entry.flags,
        type_spec,
    })
}

/// Where the strings of a (possibly truncated) entry end, from its header
fn strings_end(entry: &[u8]) -> usize {
    let string_length = |at: usize| {
        entry
            .get(at..at + 2)
            .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]) as usize)
    };
    ENTRY_HEADER_SIZE + string_length(24) + string_length(26) + string_length(28) + 3
}

/// Parse an uploaded symbol table, leniently
///
/// Parsing stops at a zero entry length, at the end of the data, or after
/// `symbol_count` entries. A trailing entry cut short by the PLC is padded
/// with zeros and parsed as far as it goes.
pub fn parse_symbol_table(data: &[u8], symbol_count: usize) -> Vec<SymbolEntry> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while entries.len() < symbol_count && offset + 4 <= data.len() {
        let entry_length = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if entry_length == 0 {
            break;
        }
        let end = offset.saturating_add(entry_length);
        let parsed = if end <= data.len() {
            SymbolEntry::parse(&data[offset..end])
                .map(|(_, entry)| entry)
                .map_err(|e| e.to_string())
        } else {
            warn!(
                "Symbol table entry at {offset} is truncated ({} of {entry_length} bytes), padding",
                data.len() - offset
            );
            let available = &data[offset..];
            // Only pad as far as the strings need; the declared length is untrusted
            let padded_length = strings_end(available)
                .max(available.len())
                .min(entry_length);
            let mut padded = available.to_vec();
            padded.resize(padded_length, 0);
            padded[..4].copy_from_slice(&(padded_length as u32).to_le_bytes());
            SymbolEntry::parse(&padded)
                .map(|(_, entry)| entry)
                .map_err(|e| e.to_string())
        };
        match parsed {
            Ok(entry) if entry.name.is_empty() => {
                debug!("Skipping nameless symbol table entry at {offset}")
            }
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!("Could not parse symbol table entry at {offset}: {e}");
                break;
            }
        }
        offset = end;
    }
    entries
}

/// Upload the complete symbol table of a target, keyed by symbol name
pub async fn enumerate_symbols(
    session: &Session,
) -> Result<HashMap<String, SymbolEntry>, TransportError> {
    let info = session.read(ADSIGRP_SYM_UPLOADINFO, 0, 8).await?;
    if info.len() < 8 {
        return Err(TransportError::InvalidResponse(
            crate::messages::MessageError::InvalidField(
                "symbol upload info length".to_string(),
                info.len().to_string(),
            ),
        ));
    }
    let symbol_count = u32::from_le_bytes([info[0], info[1], info[2], info[3]]) as usize;
    let table_size = u32::from_le_bytes([info[4], info[5], info[6], info[7]]) as usize;
    debug!("Uploading {symbol_count} symbols ({table_size} bytes)");
    let table = session.read(ADSIGRP_SYM_UPLOAD, 0, table_size).await?;
    Ok(parse_symbol_table(&table, symbol_count)
        .into_iter()
        .map(|entry| (entry.name.clone(), entry))
        .collect())
}
