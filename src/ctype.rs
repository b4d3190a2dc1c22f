//! Map ADS runtime type information to fixed-layout decode/encode plans.
//!
//! When a PLC reports a symbol, it describes the type with three things: a
//! numeric ADS data type code (the `ADST_*` constants), a type name as written
//! in the PLC program (e.g. `INT`, `STRING(80)`, `ARRAY [0..9] OF REAL`,
//! `ST_MotorStatus`) and a total byte size. [`resolve_ctype`] turns these into a
//! [`TypeSpec`], which knows how to decode raw bytes to a [`Value`] and encode a
//! [`Value`] back to bytes.
//!
//! Resolution order is:
//! 1. An override registered in the [`TypeRegistry`] for the numeric type code
//! 2. An override registered in the [`TypeRegistry`] for the type name
//! 3. The built-in table of primitive type codes
//! 4. The built-in table of primitive IEC type names
//!
//! Every type except strings may be an array: if the reported size is a
//! multiple of the element size, the plan describes a fixed-length array of
//! that many elements. A size that is not an exact multiple cannot be decoded
//! and is rejected. Strings always have a single element; the PLC transfers the
//! whole declared buffer and the value is read up to the first NUL.
//!
//! Values are represented by [`Value`], with one variant per primitive kind, in
//! the same style for scalars and arrays (a scalar is a one-element vector).
//! Structured types can be decoded by registering a [`RecordLayout`].
//!
//! All multi-byte values on the wire are little endian.

use nom::{
    IResult, Parser,
    multi::count,
    number::complete::{le_f32, le_f64, le_i8, le_i16, le_i32, le_i64, le_u8, le_u16, le_u32, le_u64},
};
use num::NumCast;
use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
};
use thiserror::Error;

/// ADS runtime data type codes, as reported in symbol entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdsDataType {
    Void = 0,
    Int16 = 2,
    Int32 = 3,
    Real32 = 4,
    Real64 = 5,
    Int8 = 16,
    UInt8 = 17,
    UInt16 = 18,
    UInt32 = 19,
    Int64 = 20,
    UInt64 = 21,
    String = 30,
    WString = 31,
    Real80 = 32,
    Bit = 33,
    BigType = 65,
}

impl TryFrom<u32> for AdsDataType {
    type Error = ();
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Void as u32 => Ok(Self::Void),
            x if x == Self::Int16 as u32 => Ok(Self::Int16),
            x if x == Self::Int32 as u32 => Ok(Self::Int32),
            x if x == Self::Real32 as u32 => Ok(Self::Real32),
            x if x == Self::Real64 as u32 => Ok(Self::Real64),
            x if x == Self::Int8 as u32 => Ok(Self::Int8),
            x if x == Self::UInt8 as u32 => Ok(Self::UInt8),
            x if x == Self::UInt16 as u32 => Ok(Self::UInt16),
            x if x == Self::UInt32 as u32 => Ok(Self::UInt32),
            x if x == Self::Int64 as u32 => Ok(Self::Int64),
            x if x == Self::UInt64 as u32 => Ok(Self::UInt64),
            x if x == Self::String as u32 => Ok(Self::String),
            x if x == Self::WString as u32 => Ok(Self::WString),
            x if x == Self::Real80 as u32 => Ok(Self::Real80),
            x if x == Self::Bit as u32 => Ok(Self::Bit),
            x if x == Self::BigType as u32 => Ok(Self::BigType),
            _ => Err(()),
        }
    }
}

/// Primitive PLC data kinds that can be decoded without extra layout information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcType {
    Bool,
    SInt,
    USInt,
    Int,
    UInt,
    DInt,
    UDInt,
    LInt,
    ULInt,
    Real,
    LReal,
    String,
}

impl PlcType {
    /// Size in bytes of one element. Strings are sized by their declaration, so 0.
    pub fn size(self) -> usize {
        match self {
            PlcType::Bool | PlcType::SInt | PlcType::USInt => 1,
            PlcType::Int | PlcType::UInt => 2,
            PlcType::DInt | PlcType::UDInt | PlcType::Real => 4,
            PlcType::LInt | PlcType::ULInt | PlcType::LReal => 8,
            PlcType::String => 0,
        }
    }

    /// The built-in decode plan for a runtime type code, if there is one
    ///
    /// `Void`, `BigType`, `WString` and `Real80` have no built-in plan.
    pub fn from_data_type(data_type: AdsDataType) -> Option<Self> {
        Some(match data_type {
            AdsDataType::Int8 => PlcType::SInt,
            AdsDataType::UInt8 => PlcType::USInt,
            AdsDataType::Int16 => PlcType::Int,
            AdsDataType::UInt16 => PlcType::UInt,
            AdsDataType::Int32 => PlcType::DInt,
            AdsDataType::UInt32 => PlcType::UDInt,
            AdsDataType::Int64 => PlcType::LInt,
            AdsDataType::UInt64 => PlcType::ULInt,
            AdsDataType::Real32 => PlcType::Real,
            AdsDataType::Real64 => PlcType::LReal,
            AdsDataType::String => PlcType::String,
            AdsDataType::Bit => PlcType::Bool,
            AdsDataType::Void
            | AdsDataType::BigType
            | AdsDataType::WString
            | AdsDataType::Real80 => return None,
        })
    }

    /// The built-in decode plan for an IEC 61131-3 elementary type name
    pub fn from_type_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Some(match name.to_ascii_uppercase().as_str() {
            "BOOL" | "BIT" => PlcType::Bool,
            "SINT" => PlcType::SInt,
            "USINT" | "BYTE" => PlcType::USInt,
            "INT" => PlcType::Int,
            "UINT" | "WORD" => PlcType::UInt,
            "DINT" => PlcType::DInt,
            "UDINT" | "DWORD" => PlcType::UDInt,
            "LINT" => PlcType::LInt,
            "ULINT" | "LWORD" => PlcType::ULInt,
            "REAL" => PlcType::Real,
            "LREAL" => PlcType::LReal,
            n if n == "STRING" || (n.starts_with("STRING(") && n.ends_with(')')) => {
                PlcType::String
            }
            _ => return None,
        })
    }
}

impl Display for PlcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlcType::Bool => "BOOL",
            PlcType::SInt => "SINT",
            PlcType::USInt => "USINT",
            PlcType::Int => "INT",
            PlcType::UInt => "UINT",
            PlcType::DInt => "DINT",
            PlcType::UDInt => "UDINT",
            PlcType::LInt => "LINT",
            PlcType::ULInt => "ULINT",
            PlcType::Real => "REAL",
            PlcType::LReal => "LREAL",
            PlcType::String => "STRING",
        };
        f.write_str(name)
    }
}

/// One named member of a [`RecordLayout`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordField {
    pub name: String,
    /// Byte offset from the start of the record
    pub offset: usize,
    pub kind: PlcType,
    /// Number of elements. For [`PlcType::String`] this is the byte length
    /// of the string buffer instead.
    pub count: usize,
}

impl RecordField {
    fn byte_size(&self) -> usize {
        match self.kind {
            PlcType::String => self.count,
            kind => kind.size() * self.count,
        }
    }
}

/// Caller-supplied fixed layout for a structured PLC type
///
/// ```
/// use adsars::ctype::{PlcType, RecordLayout};
///
/// let layout = RecordLayout::new("ST_Motor", 16)
///     .field("bEnabled", 0, PlcType::Bool, 1)
///     .field("nState", 2, PlcType::Int, 1)
///     .field("fPosition", 8, PlcType::LReal, 1);
/// assert_eq!(layout.size(), 16);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    name: String,
    size: usize,
    fields: Vec<RecordField>,
}

impl RecordLayout {
    pub fn new(name: &str, size: usize) -> Self {
        RecordLayout {
            name: name.to_string(),
            size,
            fields: Vec::new(),
        }
    }

    /// Add a field. Fields that would extend past the declared size grow it.
    pub fn field(mut self, name: &str, offset: usize, kind: PlcType, count: usize) -> Self {
        let field = RecordField {
            name: name.to_string(),
            offset,
            kind,
            count: count.max(1),
        };
        self.size = self.size.max(offset + field.byte_size());
        self.fields.push(field);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn fields(&self) -> &[RecordField] {
        &self.fields
    }
}

/// What a symbol decodes as
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Primitive(PlcType),
    Record(Arc<RecordLayout>),
}

/// Key for registering an override in a [`TypeRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Code(u32),
    Name(String),
}

/// Overrides consulted before the built-in tables
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    overrides: HashMap<TypeKey, TypeKind>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    pub fn register(&mut self, key: TypeKey, kind: TypeKind) -> &mut Self {
        self.overrides.insert(key, kind);
        self
    }

    /// Decode every symbol whose PLC type name is `type_name` with `layout`
    pub fn register_record(&mut self, type_name: &str, layout: RecordLayout) -> &mut Self {
        self.register(
            TypeKey::Name(type_name.to_string()),
            TypeKind::Record(Arc::new(layout)),
        )
    }

    fn lookup(&self, type_code: u32, type_name: &str) -> Option<&TypeKind> {
        self.overrides
            .get(&TypeKey::Code(type_code))
            .or_else(|| self.overrides.get(&TypeKey::Name(type_name.to_string())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Unsupported data type {type_name:?} (number={type_code} size={size} comment={comment:?}): {reason}"
)]
pub struct UnsupportedType {
    pub type_name: String,
    pub type_code: u32,
    pub size: usize,
    pub comment: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Value does not match symbol type: {0}")]
pub struct TypeMismatch(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Could not decode {type_name}: expected {expected} bytes, got {actual}")]
pub struct DecodeError {
    pub type_name: String,
    pub expected: usize,
    pub actual: usize,
}

/// A complete decode/encode plan for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    /// Raw ADS data type code reported by the PLC
    pub type_code: u32,
    pub kind: TypeKind,
    /// Size of one element, in bytes
    pub primitive_size: usize,
    /// Number of elements; 1 for scalars and strings
    pub element_count: usize,
    pub comment: String,
    /// The type name exactly as reported by the PLC
    pub type_name: String,
}

/// Build the decode plan for a symbol from the type information the PLC reports
pub fn resolve_ctype(
    type_code: u32,
    type_name: &str,
    reported_size: usize,
    comment: &str,
    overrides: &TypeRegistry,
) -> Result<TypeSpec, UnsupportedType> {
    let unsupported = |reason: &str| UnsupportedType {
        type_name: type_name.to_string(),
        type_code,
        size: reported_size,
        comment: comment.to_string(),
        reason: reason.to_string(),
    };

    let kind = overrides
        .lookup(type_code, type_name)
        .cloned()
        .or_else(|| {
            AdsDataType::try_from(type_code)
                .ok()
                .and_then(PlcType::from_data_type)
                .or_else(|| PlcType::from_type_name(type_name))
                .map(TypeKind::Primitive)
        })
        .ok_or_else(|| unsupported("no decode plan for this type"))?;

    let (primitive_size, element_count) = match &kind {
        TypeKind::Primitive(PlcType::String) => (reported_size, 1),
        TypeKind::Primitive(plc_type) => (plc_type.size(), reported_size / plc_type.size()),
        TypeKind::Record(layout) if layout.size() == 0 => {
            return Err(unsupported("record layout has zero size"));
        }
        TypeKind::Record(layout) => (layout.size(), reported_size / layout.size()),
    };
    if primitive_size == 0 || element_count == 0 {
        return Err(unsupported("reported size is smaller than one element"));
    }
    if primitive_size * element_count != reported_size {
        return Err(unsupported(
            "reported size is not a whole multiple of the element size",
        ));
    }

    Ok(TypeSpec {
        type_code,
        kind,
        primitive_size,
        element_count,
        comment: comment.to_string(),
        type_name: type_name.to_string(),
    })
}

impl TypeSpec {
    /// A plan for a scalar or array of a primitive, without asking a PLC
    pub fn primitive(kind: PlcType, element_count: usize) -> Self {
        let (primitive_size, element_count) = match kind {
            PlcType::String => (element_count, 1),
            kind => (kind.size(), element_count.max(1)),
        };
        TypeSpec {
            type_code: 0,
            kind: TypeKind::Primitive(kind),
            primitive_size,
            element_count,
            comment: String::new(),
            type_name: kind.to_string(),
        }
    }

    /// Total number of bytes the symbol occupies in PLC memory
    pub fn byte_size(&self) -> usize {
        self.primitive_size * self.element_count
    }

    pub fn data_type(&self) -> Option<AdsDataType> {
        AdsDataType::try_from(self.type_code).ok()
    }

    pub fn is_array(&self) -> bool {
        self.element_count > 1
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value, DecodeError> {
        match &self.kind {
            TypeKind::Primitive(PlcType::String) => Ok(Value::String(decode_string(data))),
            TypeKind::Primitive(kind) => {
                if data.len() < self.byte_size() {
                    return Err(self.decode_error(data.len()));
                }
                Value::decode(*kind, self.element_count, data)
                    .ok_or_else(|| self.decode_error(data.len()))
            }
            TypeKind::Record(layout) => {
                if data.len() < self.byte_size() {
                    return Err(self.decode_error(data.len()));
                }
                data.chunks(layout.size())
                    .take(self.element_count)
                    .map(|chunk| decode_record(layout, chunk))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Record)
                    .ok_or_else(|| self.decode_error(data.len()))
            }
        }
    }

    /// Encode a value into the exact byte layout of the symbol
    ///
    /// Numeric values are converted to the symbol type where this is possible
    /// without overflow; the element count must match exactly.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, TypeMismatch> {
        match &self.kind {
            TypeKind::Primitive(PlcType::String) => {
                let Value::String(s) = value else {
                    return Err(TypeMismatch(format!(
                        "{} requires a string, got {value:?}",
                        self.type_name
                    )));
                };
                encode_string(s, self.primitive_size)
            }
            TypeKind::Primitive(kind) => {
                let converted = value.convert_to(*kind)?;
                if converted.get_count() != self.element_count {
                    return Err(TypeMismatch(format!(
                        "{} has {} elements, value has {}",
                        self.type_name,
                        self.element_count,
                        converted.get_count()
                    )));
                }
                Ok(converted.to_bytes())
            }
            TypeKind::Record(layout) => {
                let Value::Record(records) = value else {
                    return Err(TypeMismatch(format!(
                        "{} requires a record, got {value:?}",
                        layout.name()
                    )));
                };
                if records.len() != self.element_count {
                    return Err(TypeMismatch(format!(
                        "{} has {} elements, value has {}",
                        self.type_name,
                        self.element_count,
                        records.len()
                    )));
                }
                let mut buffer = Vec::with_capacity(self.byte_size());
                for record in records {
                    buffer.extend(encode_record(layout, record)?);
                }
                Ok(buffer)
            }
        }
    }

    fn decode_error(&self, actual: usize) -> DecodeError {
        DecodeError {
            type_name: self.type_name.clone(),
            expected: self.byte_size(),
            actual,
        }
    }
}

fn decode_string(data: &[u8]) -> String {
    let strlen = data.iter().position(|&c| c == 0x00).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..strlen]).into_owned()
}

/// Encode a string into a fixed buffer, always leaving room for the terminator
fn encode_string(value: &str, buffer_size: usize) -> Result<Vec<u8>, TypeMismatch> {
    let mut buffer = value.as_bytes().to_vec();
    if buffer.len() >= buffer_size {
        return Err(TypeMismatch(format!(
            "String of {} bytes does not fit in a buffer of {buffer_size}",
            buffer.len()
        )));
    }
    buffer.resize(buffer_size, 0u8);
    Ok(buffer)
}

fn decode_record(layout: &RecordLayout, data: &[u8]) -> Option<Record> {
    layout
        .fields()
        .iter()
        .map(|field| {
            let raw = data.get(field.offset..field.offset + field.byte_size())?;
            let value = match field.kind {
                PlcType::String => Value::String(decode_string(raw)),
                kind => Value::decode(kind, field.count, raw)?,
            };
            Some((field.name.clone(), value))
        })
        .collect()
}

fn encode_record(layout: &RecordLayout, record: &Record) -> Result<Vec<u8>, TypeMismatch> {
    let mut buffer = vec![0u8; layout.size()];
    for field in layout.fields() {
        let Some((_, value)) = record.iter().find(|(name, _)| name == &field.name) else {
            return Err(TypeMismatch(format!(
                "Record {} is missing field {}",
                layout.name(),
                field.name
            )));
        };
        let bytes = TypeSpec::primitive(field.kind, field.count).encode(value)?;
        buffer[field.offset..field.offset + bytes.len()].copy_from_slice(&bytes);
    }
    Ok(buffer)
}

/// Named member values of one decoded record, in layout order
pub type Record = Vec<(String, Value)>;

/// A decoded PLC value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(Vec<bool>),
    SInt(Vec<i8>),
    USInt(Vec<u8>),
    Int(Vec<i16>),
    UInt(Vec<u16>),
    DInt(Vec<i32>),
    UDInt(Vec<u32>),
    LInt(Vec<i64>),
    ULInt(Vec<u64>),
    Real(Vec<f32>),
    LReal(Vec<f64>),
    String(String),
    Record(Vec<Record>),
}

fn decode_elements<'a, T, F>(data: &'a [u8], elements: usize, parser: F) -> Option<Vec<T>>
where
    F: Parser<&'a [u8], Output = T, Error = nom::error::Error<&'a [u8]>>,
{
    let result: IResult<&[u8], Vec<T>> = count(parser, elements).parse(data);
    result.ok().map(|(_, values)| values)
}

impl Value {
    pub fn get_count(&self) -> usize {
        match self {
            Value::Bool(v) => v.len(),
            Value::SInt(v) => v.len(),
            Value::USInt(v) => v.len(),
            Value::Int(v) => v.len(),
            Value::UInt(v) => v.len(),
            Value::DInt(v) => v.len(),
            Value::UDInt(v) => v.len(),
            Value::LInt(v) => v.len(),
            Value::ULInt(v) => v.len(),
            Value::Real(v) => v.len(),
            Value::LReal(v) => v.len(),
            Value::String(_) => 1,
            Value::Record(v) => v.len(),
        }
    }

    /// The primitive kind of this value, or `None` for records
    pub fn get_type(&self) -> Option<PlcType> {
        Some(match self {
            Value::Bool(_) => PlcType::Bool,
            Value::SInt(_) => PlcType::SInt,
            Value::USInt(_) => PlcType::USInt,
            Value::Int(_) => PlcType::Int,
            Value::UInt(_) => PlcType::UInt,
            Value::DInt(_) => PlcType::DInt,
            Value::UDInt(_) => PlcType::UDInt,
            Value::LInt(_) => PlcType::LInt,
            Value::ULInt(_) => PlcType::ULInt,
            Value::Real(_) => PlcType::Real,
            Value::LReal(_) => PlcType::LReal,
            Value::String(_) => PlcType::String,
            Value::Record(_) => return None,
        })
    }

    fn decode(kind: PlcType, elements: usize, data: &[u8]) -> Option<Value> {
        Some(match kind {
            PlcType::Bool => Value::Bool(
                decode_elements(data, elements, le_u8)?
                    .into_iter()
                    .map(|b| b != 0)
                    .collect(),
            ),
            PlcType::SInt => Value::SInt(decode_elements(data, elements, le_i8)?),
            PlcType::USInt => Value::USInt(decode_elements(data, elements, le_u8)?),
            PlcType::Int => Value::Int(decode_elements(data, elements, le_i16)?),
            PlcType::UInt => Value::UInt(decode_elements(data, elements, le_u16)?),
            PlcType::DInt => Value::DInt(decode_elements(data, elements, le_i32)?),
            PlcType::UDInt => Value::UDInt(decode_elements(data, elements, le_u32)?),
            PlcType::LInt => Value::LInt(decode_elements(data, elements, le_i64)?),
            PlcType::ULInt => Value::ULInt(decode_elements(data, elements, le_u64)?),
            PlcType::Real => Value::Real(decode_elements(data, elements, le_f32)?),
            PlcType::LReal => Value::LReal(decode_elements(data, elements, le_f64)?),
            PlcType::String => Value::String(decode_string(data)),
        })
    }

    /// Encode the elements of a primitive value, little endian
    ///
    /// Strings are encoded without terminator or padding; records encode to
    /// nothing, as they need a layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bool(v) => v.iter().map(|b| *b as u8).collect(),
            Value::SInt(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::USInt(v) => v.clone(),
            Value::Int(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::UInt(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::DInt(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::UDInt(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::LInt(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::ULInt(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::Real(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::LReal(v) => v.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Record(_) => Vec::new(),
        }
    }

    /// Convert to another primitive kind
    ///
    /// Numeric conversions fail if any element is out of range of the target.
    /// Floating point values are truncated towards zero when converted to an
    /// integer kind. Strings are parsed as a single number.
    pub fn convert_to(&self, kind: PlcType) -> Result<Value, TypeMismatch> {
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, TypeMismatch>
        where
            T: Copy + NumCast + fmt::Debug,
            U: NumCast,
        {
            from.iter()
                .map(|n| {
                    NumCast::from(*n)
                        .ok_or_else(|| TypeMismatch(format!("Cannot represent {n:?}")))
                })
                .collect()
        }
        fn _convert_all<U: NumCast>(value: &Value) -> Result<Vec<U>, TypeMismatch> {
            match value {
                Value::Bool(v) => Ok(v
                    .iter()
                    .map(|b| NumCast::from(*b as u8))
                    .collect::<Option<Vec<U>>>()
                    .ok_or_else(|| TypeMismatch("Cannot represent bool".to_string()))?),
                Value::SInt(v) => _try_convert_vec(v),
                Value::USInt(v) => _try_convert_vec(v),
                Value::Int(v) => _try_convert_vec(v),
                Value::UInt(v) => _try_convert_vec(v),
                Value::DInt(v) => _try_convert_vec(v),
                Value::UDInt(v) => _try_convert_vec(v),
                Value::LInt(v) => _try_convert_vec(v),
                Value::ULInt(v) => _try_convert_vec(v),
                Value::Real(v) => _try_convert_vec(v),
                Value::LReal(v) => _try_convert_vec(v),
                Value::String(s) => {
                    let parsed: f64 = s
                        .trim()
                        .parse()
                        .map_err(|_| TypeMismatch(format!("Cannot parse {s:?} as a number")))?;
                    _try_convert_vec(&[parsed])
                }
                Value::Record(_) => Err(TypeMismatch(
                    "Records cannot be converted to a primitive".to_string(),
                )),
            }
        }

        if self.get_type() == Some(kind) {
            return Ok(self.clone());
        }
        Ok(match kind {
            PlcType::Bool => match self {
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Value::Bool(vec![true]),
                    "false" => Value::Bool(vec![false]),
                    _ => Value::Bool(_convert_all::<f64>(self)?.iter().map(|v| *v != 0.0).collect()),
                },
                _ => Value::Bool(_convert_all::<f64>(self)?.iter().map(|v| *v != 0.0).collect()),
            },
            PlcType::SInt => Value::SInt(_convert_all(self)?),
            PlcType::USInt => Value::USInt(_convert_all(self)?),
            PlcType::Int => Value::Int(_convert_all(self)?),
            PlcType::UInt => Value::UInt(_convert_all(self)?),
            PlcType::DInt => Value::DInt(_convert_all(self)?),
            PlcType::UDInt => Value::UDInt(_convert_all(self)?),
            PlcType::LInt => Value::LInt(_convert_all(self)?),
            PlcType::ULInt => Value::ULInt(_convert_all(self)?),
            PlcType::Real => Value::Real(_convert_all(self)?),
            PlcType::LReal => Value::LReal(_convert_all(self)?),
            PlcType::String => {
                return Err(TypeMismatch(format!(
                    "Cannot convert {self:?} to a string"
                )));
            }
        })
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: Display>(values: &[T]) -> String {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }
        match self {
            Value::Bool(v) => f.write_str(&join(v)),
            Value::SInt(v) => f.write_str(&join(v)),
            Value::USInt(v) => f.write_str(&join(v)),
            Value::Int(v) => f.write_str(&join(v)),
            Value::UInt(v) => f.write_str(&join(v)),
            Value::DInt(v) => f.write_str(&join(v)),
            Value::UDInt(v) => f.write_str(&join(v)),
            Value::LInt(v) => f.write_str(&join(v)),
            Value::ULInt(v) => f.write_str(&join(v)),
            Value::Real(v) => f.write_str(&join(v)),
            Value::LReal(v) => f.write_str(&join(v)),
            Value::String(s) => f.write_str(s),
            Value::Record(records) => {
                let rendered: Vec<String> = records
                    .iter()
                    .map(|record| {
                        let fields: Vec<String> = record
                            .iter()
                            .map(|(name, value)| format!("{name}={value}"))
                            .collect();
                        format!("{{{}}}", fields.join(", "))
                    })
                    .collect();
                f.write_str(&rendered.join(" "))
            }
        }
    }
}

/// Implement conversions between a [`Value`] variant and its native type
macro_rules! impl_value_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for Value {
            fn from(value: Vec<$typ>) -> Self {
                Value::$variant(value)
            }
        }
        impl From<$typ> for Value {
            fn from(value: $typ) -> Self {
                Value::$variant(vec![value])
            }
        }
        impl TryFrom<&Value> for Vec<$typ> {
            type Error = TypeMismatch;
            fn try_from(value: &Value) -> Result<Self, Self::Error> {
                match value.convert_to(PlcType::$variant)? {
                    Value::$variant(v) => Ok(v),
                    _ => unreachable!(),
                }
            }
        }
        impl TryFrom<&Value> for $typ {
            type Error = TypeMismatch;
            fn try_from(value: &Value) -> Result<Self, Self::Error> {
                match Vec::<$typ>::try_from(value)?.as_slice() {
                    [single] => Ok(*single),
                    other => Err(TypeMismatch(format!(
                        "Expected a single element, got {}",
                        other.len()
                    ))),
                }
            }
        }
    };
}
impl_value_conversions_between!(Bool, bool);
impl_value_conversions_between!(SInt, i8);
impl_value_conversions_between!(USInt, u8);
impl_value_conversions_between!(Int, i16);
impl_value_conversions_between!(UInt, u16);
impl_value_conversions_between!(DInt, i32);
impl_value_conversions_between!(UDInt, u32);
impl_value_conversions_between!(LInt, i64);
impl_value_conversions_between!(ULInt, u64);
impl_value_conversions_between!(Real, f32);
impl_value_conversions_between!(LReal, f64);

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(type_code: u32, type_name: &str, size: usize) -> Result<TypeSpec, UnsupportedType> {
        resolve_ctype(type_code, type_name, size, "", &TypeRegistry::default())
    }

    #[test]
    fn scalar_and_array_resolution() {
        let spec = builtin(AdsDataType::Int16 as u32, "INT", 2).unwrap();
        assert_eq!(spec.kind, TypeKind::Primitive(PlcType::Int));
        assert_eq!(spec.element_count, 1);

        let spec = builtin(AdsDataType::Real64 as u32, "ARRAY [1..5] OF LREAL", 40).unwrap();
        assert_eq!(spec.kind, TypeKind::Primitive(PlcType::LReal));
        assert_eq!(spec.element_count, 5);
        assert!(spec.is_array());
    }

    #[test]
    fn string_is_always_single_element() {
        let spec = builtin(AdsDataType::String as u32, "STRING(80)", 81).unwrap();
        assert_eq!(spec.element_count, 1);
        assert_eq!(spec.primitive_size, 81);
        let value = spec.decode(b"hello\0garbage").unwrap();
        assert_eq!(value, Value::String("hello".to_string()));
        let encoded = spec.encode(&"hi".into()).unwrap();
        assert_eq!(encoded.len(), 81);
        assert_eq!(&encoded[..3], b"hi\0");
        assert!(spec.encode(&"x".repeat(81).into()).is_err());
    }

    #[test]
    fn size_not_a_multiple_is_unsupported() {
        assert!(builtin(AdsDataType::Int32 as u32, "DINT", 6).is_err());
        assert!(builtin(AdsDataType::Int32 as u32, "DINT", 0).is_err());
    }

    #[test]
    fn unknown_types() {
        let err = builtin(AdsDataType::BigType as u32, "ST_Thing", 24).unwrap_err();
        assert_eq!(err.type_name, "ST_Thing");
        assert_eq!(err.type_code, 65);
        // Falls back to the type name when the code is unknown
        let spec = builtin(999, "UDINT", 4).unwrap();
        assert_eq!(spec.kind, TypeKind::Primitive(PlcType::UDInt));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut registry = TypeRegistry::new();
        registry.register(TypeKey::Code(AdsDataType::Int16 as u32), TypeKind::Primitive(PlcType::UInt));
        let spec = resolve_ctype(2, "INT", 4, "", &registry).unwrap();
        assert_eq!(spec.kind, TypeKind::Primitive(PlcType::UInt));
        assert_eq!(spec.element_count, 2);

        registry.register_record(
            "ST_Pair",
            RecordLayout::new("ST_Pair", 8)
                .field("a", 0, PlcType::DInt, 1)
                .field("b", 4, PlcType::Real, 1),
        );
        let spec = resolve_ctype(65, "ST_Pair", 16, "", &registry).unwrap();
        assert_eq!(spec.element_count, 2);
        let mut data = Vec::new();
        for (a, b) in [(1i32, 1.5f32), (-2, 0.25)] {
            data.extend(a.to_le_bytes());
            data.extend(b.to_le_bytes());
        }
        let value = spec.decode(&data).unwrap();
        let Value::Record(records) = &value else {
            panic!("Expected records, got {value:?}");
        };
        assert_eq!(records[1][0], ("a".to_string(), Value::DInt(vec![-2])));
        assert_eq!(records[1][1], ("b".to_string(), Value::Real(vec![0.25])));
        assert_eq!(spec.encode(&value).unwrap(), data);
    }

    #[test]
    fn decode_short_data_fails() {
        let spec = builtin(AdsDataType::Int32 as u32, "DINT", 8).unwrap();
        assert!(spec.decode(&[0u8; 4]).is_err());
        assert_eq!(
            spec.decode(&[1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]).unwrap(),
            Value::DInt(vec![1, -1])
        );
    }

    #[test]
    fn encode_converts_numbers() {
        let spec = builtin(AdsDataType::Int16 as u32, "INT", 2).unwrap();
        assert_eq!(spec.encode(&3.7f64.into()).unwrap(), vec![3, 0]);
        assert_eq!(spec.encode(&"-2".into()).unwrap(), (-2i16).to_le_bytes().to_vec());
        assert!(spec.encode(&70000i32.into()).is_err());
        assert!(spec.encode(&vec![1i16, 2].into()).is_err());

        let spec = builtin(AdsDataType::Bit as u32, "BOOL", 1).unwrap();
        assert_eq!(spec.encode(&1i32.into()).unwrap(), vec![1]);
        assert_eq!(spec.encode(&"false".into()).unwrap(), vec![0]);
    }

    #[test]
    fn native_conversions() {
        let value: Value = vec![1.5f32, 2.5].into();
        let as_ints: Vec<i32> = (&value).try_into().unwrap();
        assert_eq!(as_ints, vec![1, 2]);
        assert!(i32::try_from(&value).is_err());
        assert_eq!(f64::try_from(&Value::from(7u8)).unwrap(), 7.0);
        assert_eq!(Value::Int(vec![1, -2, 3]).to_string(), "1 -2 3");
    }
}
