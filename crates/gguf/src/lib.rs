//! Shared GGUF container types: tag enumerations, metadata values and the
//! byte-size geometry of every supported storage type, plus a validating
//! mmap-backed reader ([`GgufReader`]) used to check produced files.

use std::fmt;

use thiserror::Error;

mod reader;

pub use reader::{GgufHeader, GgufReader, TensorInfo};

/// `GGUF` in little-endian byte order.
pub const GGUF_MAGIC: u32 = 0x4655_4747;
/// Container format version emitted by the writer.
pub const GGUF_VERSION: u32 = 3;
/// Every tensor's data, and the data section itself, starts on this boundary.
pub const GGUF_ALIGNMENT: u64 = 32;

/// Errors surfaced while building or reading a GGUF container.
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid magic: found {found:#010x}, expected {expected:#010x}", expected = GGUF_MAGIC)]
    InvalidMagic { found: u32 },
    #[error("unsupported version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("unknown tensor type tag {0}")]
    UnknownTensorType(u32),
    #[error("unknown metadata type tag {0}")]
    UnknownMetadataType(u32),
    #[error("array declared element type {expected} but holds a {found} value")]
    ArrayElementMismatch {
        expected: MetadataType,
        found: MetadataType,
    },
    #[error("container malformed: {0}")]
    Format(String),
    #[error("container validation failed: {0}")]
    Validation(String),
    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Result alias for GGUF operations.
pub type Result<T> = std::result::Result<T, GgufError>;

/// On-disk representation of a tensor's elements.
///
/// Tag values are the stable GGML type ids; the tag space has many more
/// entries but only these four are exercised by the export pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    F32,
    F16,
    Q8_0,
    Q4K,
}

impl TensorType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q8_0 => 8,
            Self::Q4K => 12,
        }
    }

    /// Elements quantized together under one shared scale. Raw types are 1.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q8_0 => 32,
            Self::Q4K => 256,
        }
    }

    /// Bytes one full block occupies on disk.
    pub fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q8_0 => 34,
            Self::Q4K => 144,
        }
    }

    pub fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// Storage size of a tensor with `elements` logical values. The final
    /// partial block of a quantized tensor is padded to a whole block.
    pub fn byte_size(self, elements: usize) -> u64 {
        let blocks = elements.div_ceil(self.block_size()) as u64;
        blocks * self.block_bytes() as u64
    }
}

impl TryFrom<u32> for TensorType {
    type Error = GgufError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            8 => Ok(Self::Q8_0),
            12 => Ok(Self::Q4K),
            other => Err(GgufError::UnknownTensorType(other)),
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => f.write_str("F32"),
            Self::F16 => f.write_str("F16"),
            Self::Q8_0 => f.write_str("Q8_0"),
            Self::Q4K => f.write_str("Q4_K"),
        }
    }
}

/// Type tag of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl MetadataType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::F32 => 6,
            Self::Bool => 7,
            Self::String => 8,
            Self::Array => 9,
            Self::U64 => 10,
            Self::I64 => 11,
            Self::F64 => 12,
        }
    }
}

impl TryFrom<u32> for MetadataType {
    type Error = GgufError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::U8),
            1 => Ok(Self::I8),
            2 => Ok(Self::U16),
            3 => Ok(Self::I16),
            4 => Ok(Self::U32),
            5 => Ok(Self::I32),
            6 => Ok(Self::F32),
            7 => Ok(Self::Bool),
            8 => Ok(Self::String),
            9 => Ok(Self::Array),
            10 => Ok(Self::U64),
            11 => Ok(Self::I64),
            12 => Ok(Self::F64),
            other => Err(GgufError::UnknownMetadataType(other)),
        }
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Array => "array",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A typed metadata value. Integer widths are chosen by the producer and
/// written verbatim with the matching tag; the writer never widens or
/// truncates a value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(MetadataArray),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn metadata_type(&self) -> MetadataType {
        match self {
            Self::U8(_) => MetadataType::U8,
            Self::I8(_) => MetadataType::I8,
            Self::U16(_) => MetadataType::U16,
            Self::I16(_) => MetadataType::I16,
            Self::U32(_) => MetadataType::U32,
            Self::I32(_) => MetadataType::I32,
            Self::F32(_) => MetadataType::F32,
            Self::Bool(_) => MetadataType::Bool,
            Self::String(_) => MetadataType::String,
            Self::Array(_) => MetadataType::Array,
            Self::U64(_) => MetadataType::U64,
            Self::I64(_) => MetadataType::I64,
            Self::F64(_) => MetadataType::F64,
        }
    }

    /// Append the value's type tag and payload in wire order.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.metadata_type().as_u32().to_le_bytes());
        self.encode_payload(out);
    }

    /// Payload only, without the leading tag. Array elements are encoded
    /// this way since their type is recorded once per array.
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::U8(v) => out.push(*v),
            Self::I8(v) => out.push(*v as u8),
            Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Bool(v) => out.push(u8::from(*v)),
            Self::String(v) => encode_string(out, v),
            Self::Array(arr) => arr.encode_payload(out),
            Self::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Homogeneous metadata array. The element type is validated at
/// construction and recorded exactly once on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataArray {
    elem_type: MetadataType,
    values: Vec<MetadataValue>,
}

impl MetadataArray {
    pub fn new(elem_type: MetadataType, values: Vec<MetadataValue>) -> Result<Self> {
        for value in &values {
            let found = value.metadata_type();
            if found != elem_type {
                return Err(GgufError::ArrayElementMismatch {
                    expected: elem_type,
                    found,
                });
            }
        }
        Ok(Self { elem_type, values })
    }

    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values
            .into_iter()
            .map(|s| MetadataValue::String(s.into()))
            .collect();
        Self {
            elem_type: MetadataType::String,
            values,
        }
    }

    pub fn i64s(values: impl IntoIterator<Item = i64>) -> Self {
        let values = values.into_iter().map(MetadataValue::I64).collect();
        Self {
            elem_type: MetadataType::I64,
            values,
        }
    }

    pub fn f32s(values: impl IntoIterator<Item = f32>) -> Self {
        let values = values.into_iter().map(MetadataValue::F32).collect();
        Self {
            elem_type: MetadataType::F32,
            values,
        }
    }

    pub fn elem_type(&self) -> MetadataType {
        self.elem_type
    }

    pub fn values(&self) -> &[MetadataValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.elem_type.as_u32().to_le_bytes());
        out.extend_from_slice(&(self.values.len() as u64).to_le_bytes());
        for value in &self.values {
            value.encode_payload(out);
        }
    }
}

/// Append a length-prefixed UTF-8 string in wire order (u64 length).
pub fn encode_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}
