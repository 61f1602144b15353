//! Validating reader for produced GGUF files. Parses the header, metadata
//! and tensor descriptors, checks layout invariants (magic, version,
//! monotonic 32-byte-aligned offsets, data bounds) and hands out raw
//! per-tensor byte slices. Tensor numerics are left to the consumer.

use std::{
    collections::HashMap,
    fs::File,
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use crate::{
    GgufError, MetadataArray, MetadataType, MetadataValue, Result, TensorType, GGUF_ALIGNMENT,
    GGUF_MAGIC, GGUF_VERSION,
};

/// Fixed-size header fields of a GGUF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
}

/// Descriptor of one tensor as encoded in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ttype: TensorType,
    /// Byte offset relative to the start of the data section.
    pub offset: u64,
}

impl TensorInfo {
    pub fn elements(&self) -> u64 {
        self.dims.iter().product()
    }

    pub fn byte_size(&self) -> u64 {
        self.ttype.byte_size(self.elements() as usize)
    }
}

/// Reader that mmaps a GGUF file and exposes zero-copy tensor slices.
#[derive(Debug)]
pub struct GgufReader {
    path: PathBuf,
    data: Mmap,
    header: GgufHeader,
    metadata: Vec<(String, MetadataValue)>,
    infos: Vec<TensorInfo>,
    index: HashMap<String, usize>,
    data_start: usize,
}

impl GgufReader {
    /// Open a GGUF file from disk, validating header and layout constraints.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let data = unsafe { Mmap::map(&file)? };
        let parsed = parse_index(&data)?;
        validate_layout(&parsed, data.len())?;
        let mut index = HashMap::new();
        for (idx, info) in parsed.infos.iter().enumerate() {
            if index.insert(info.name.clone(), idx).is_some() {
                return Err(GgufError::Validation(format!(
                    "duplicate tensor descriptor `{}`",
                    info.name
                )));
            }
        }
        Ok(Self {
            path,
            data,
            header: parsed.header,
            metadata: parsed.metadata,
            infos: parsed.infos,
            index,
            data_start: parsed.data_start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &GgufHeader {
        &self.header
    }

    /// Metadata entries in the order they appear in the file.
    pub fn metadata(&self) -> &[(String, MetadataValue)] {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Tensor descriptors in file order.
    pub fn tensors(&self) -> &[TensorInfo] {
        &self.infos
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.index.get(name).map(|&idx| &self.infos[idx])
    }

    /// Absolute file position where the data section begins.
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    /// Raw storage bytes for one tensor descriptor.
    pub fn tensor_bytes(&self, info: &TensorInfo) -> Result<&[u8]> {
        let start = self
            .data_start
            .checked_add(usize::try_from(info.offset).map_err(|_| {
                GgufError::Validation(format!(
                    "tensor `{}` offset {} exceeds platform usize",
                    info.name, info.offset
                ))
            })?)
            .ok_or_else(|| {
                GgufError::Validation(format!("tensor `{}` offset overflows usize", info.name))
            })?;
        let len = usize::try_from(info.byte_size()).map_err(|_| {
            GgufError::Validation(format!(
                "tensor `{}` size {} exceeds platform usize",
                info.name,
                info.byte_size()
            ))
        })?;
        let end = start.checked_add(len).ok_or_else(|| {
            GgufError::Validation(format!("tensor `{}` slice overflows usize", info.name))
        })?;
        if end > self.data.len() {
            return Err(GgufError::Validation(format!(
                "tensor `{}` slice [{start}, {end}) exceeds file size {}",
                info.name,
                self.data.len()
            )));
        }
        Ok(&self.data[start..end])
    }
}

struct ParsedIndex {
    header: GgufHeader,
    metadata: Vec<(String, MetadataValue)>,
    infos: Vec<TensorInfo>,
    data_start: usize,
}

fn parse_index(bytes: &[u8]) -> Result<ParsedIndex> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic { found: magic });
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != GGUF_VERSION {
        return Err(GgufError::UnsupportedVersion {
            found: version,
            expected: GGUF_VERSION,
        });
    }
    let tensor_count = cursor.read_u64::<LittleEndian>()?;
    let metadata_count = cursor.read_u64::<LittleEndian>()?;
    // counts come from the file; cap pre-allocation so a corrupt header
    // cannot abort with a capacity overflow before the reads fail
    let mut metadata = Vec::with_capacity(metadata_count.min(1 << 20) as usize);
    for _ in 0..metadata_count {
        let key = read_string(&mut cursor)?;
        let value = decode_value(&mut cursor)?;
        metadata.push((key, value));
    }
    let mut infos = Vec::with_capacity(tensor_count.min(1 << 20) as usize);
    for _ in 0..tensor_count {
        let name = read_string(&mut cursor)?;
        let n_dims = cursor.read_u32::<LittleEndian>()?;
        let mut dims = Vec::with_capacity(n_dims.min(64) as usize);
        for _ in 0..n_dims {
            dims.push(cursor.read_u64::<LittleEndian>()?);
        }
        let ttype = TensorType::try_from(cursor.read_u32::<LittleEndian>()?)?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        infos.push(TensorInfo {
            name,
            dims,
            ttype,
            offset,
        });
    }
    let descriptor_end = cursor.position();
    let data_start = descriptor_end.next_multiple_of(GGUF_ALIGNMENT);
    let data_start = usize::try_from(data_start)
        .map_err(|_| GgufError::Format("data section exceeds addressable range".into()))?;
    Ok(ParsedIndex {
        header: GgufHeader {
            version,
            tensor_count,
            metadata_count,
        },
        metadata,
        infos,
        data_start,
    })
}

fn validate_layout(parsed: &ParsedIndex, total_len: usize) -> Result<()> {
    if parsed.data_start > total_len && !parsed.infos.is_empty() {
        return Err(GgufError::Validation(
            "file ends before the data section begins".into(),
        ));
    }
    let mut previous_end = 0u64;
    for info in &parsed.infos {
        if info.offset % GGUF_ALIGNMENT != 0 {
            return Err(GgufError::Validation(format!(
                "tensor `{}` offset {} is not {GGUF_ALIGNMENT}-byte aligned",
                info.name, info.offset
            )));
        }
        if info.offset < previous_end {
            return Err(GgufError::Validation(format!(
                "tensor `{}` offset {} overlaps the previous tensor (ends at {previous_end})",
                info.name, info.offset
            )));
        }
        if info.dims.is_empty() || info.dims.contains(&0) {
            return Err(GgufError::Validation(format!(
                "tensor `{}` has degenerate shape {:?}",
                info.name, info.dims
            )));
        }
        let size = info.byte_size();
        let end = info.offset.checked_add(size).ok_or_else(|| {
            GgufError::Validation(format!("tensor `{}` extent overflows u64", info.name))
        })?;
        let absolute_end = (parsed.data_start as u64).checked_add(end).ok_or_else(|| {
            GgufError::Validation(format!("tensor `{}` extent overflows u64", info.name))
        })?;
        if absolute_end > total_len as u64 {
            return Err(GgufError::Validation(format!(
                "tensor `{}` data [{}, {end}) exceeds file size {total_len}",
                info.name, info.offset
            )));
        }
        previous_end = end;
    }
    Ok(())
}

fn decode_value(cursor: &mut Cursor<&[u8]>) -> Result<MetadataValue> {
    let tag = cursor.read_u32::<LittleEndian>()?;
    let mtype = MetadataType::try_from(tag)?;
    decode_payload(cursor, mtype)
}

fn decode_payload(cursor: &mut Cursor<&[u8]>, mtype: MetadataType) -> Result<MetadataValue> {
    let value = match mtype {
        MetadataType::U8 => MetadataValue::U8(cursor.read_u8()?),
        MetadataType::I8 => MetadataValue::I8(cursor.read_i8()?),
        MetadataType::U16 => MetadataValue::U16(cursor.read_u16::<LittleEndian>()?),
        MetadataType::I16 => MetadataValue::I16(cursor.read_i16::<LittleEndian>()?),
        MetadataType::U32 => MetadataValue::U32(cursor.read_u32::<LittleEndian>()?),
        MetadataType::I32 => MetadataValue::I32(cursor.read_i32::<LittleEndian>()?),
        MetadataType::F32 => MetadataValue::F32(cursor.read_f32::<LittleEndian>()?),
        MetadataType::Bool => match cursor.read_u8()? {
            0 => MetadataValue::Bool(false),
            1 => MetadataValue::Bool(true),
            other => {
                return Err(GgufError::Format(format!(
                    "boolean encoded as {other}, expected 0 or 1"
                )))
            }
        },
        MetadataType::String => MetadataValue::String(read_string(cursor)?),
        MetadataType::Array => {
            let elem_type = MetadataType::try_from(cursor.read_u32::<LittleEndian>()?)?;
            let count = cursor.read_u64::<LittleEndian>()?;
            let mut values = Vec::with_capacity(count.min(1 << 20) as usize);
            for _ in 0..count {
                values.push(decode_payload(cursor, elem_type)?);
            }
            MetadataValue::Array(MetadataArray::new(elem_type, values)?)
        }
        MetadataType::U64 => MetadataValue::U64(cursor.read_u64::<LittleEndian>()?),
        MetadataType::I64 => MetadataValue::I64(cursor.read_i64::<LittleEndian>()?),
        MetadataType::F64 => MetadataValue::F64(cursor.read_f64::<LittleEndian>()?),
    };
    Ok(value)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u64::<LittleEndian>()?;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(GgufError::Format(format!(
            "string of {len} bytes exceeds the {remaining} bytes left in the file"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|err| GgufError::Format(format!("truncated string: {err}")))?;
    Ok(String::from_utf8(buf)?)
}
