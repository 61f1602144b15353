//! Single-pass GGUF writer. A [`GgufWriter`] accumulates ordered metadata
//! entries and tensor records in memory, then serializes header, metadata,
//! tensor descriptors and the aligned data section in one forward pass.
//!
//! One writer instance builds exactly one file; it is not meant to be
//! shared across threads mid-build. Quantization of individual tensors is
//! delegated to `vision-gguf-quant`.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use half::f16;
use thiserror::Error;
use tracing::{debug, info};

use vision_gguf::{
    encode_string, MetadataValue, TensorType, GGUF_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION,
};
use vision_gguf_quant::{quantize_q4_k, quantize_q8_0, QuantError};

mod policy;

pub use policy::select_tensor_type;

/// Errors produced while building or writing a GGUF file.
#[derive(Debug, Error)]
pub enum GgufWriterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("tensor `{0}` already exists")]
    DuplicateTensor(String),
    #[error("tensor `{name}` shape {shape:?} needs {expected} values, buffer has {found}")]
    ShapeMismatch {
        name: String,
        shape: Vec<u64>,
        expected: u64,
        found: u64,
    },
    #[error("tensor `{name}` shape {shape:?} is empty or has a zero dimension")]
    InvalidShape { name: String, shape: Vec<u64> },
    #[error("value `{what}` exceeds representable range")]
    ValueOverflow { what: &'static str },
    #[error("quantization failed: {0}")]
    Quantization(#[from] QuantError),
}

pub type Result<T> = std::result::Result<T, GgufWriterError>;

#[derive(Debug)]
struct PendingTensor {
    name: String,
    shape: Vec<u64>,
    ttype: TensorType,
    values: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
struct LayoutEntry {
    offset: u64,
    size: u64,
}

/// Builder that collects metadata and tensors and emits the final file.
#[derive(Debug, Default)]
pub struct GgufWriter {
    metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<PendingTensor>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one metadata entry. Re-adding an existing key replaces its
    /// value but keeps the key's original insertion position.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: MetadataValue) {
        let key = key.into();
        match self.metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key, value)),
        }
    }

    /// Append a tensor record. The shape's element product must equal the
    /// buffer length exactly; the writer never reshapes or pads input.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        shape: &[u64],
        ttype: TensorType,
        values: Vec<f32>,
    ) -> Result<()> {
        let name = name.into();
        if self.tensors.iter().any(|t| t.name == name) {
            return Err(GgufWriterError::DuplicateTensor(name));
        }
        if shape.is_empty() || shape.contains(&0) {
            return Err(GgufWriterError::InvalidShape {
                name,
                shape: shape.to_vec(),
            });
        }
        let expected = shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
            .ok_or(GgufWriterError::ValueOverflow {
                what: "tensor elements",
            })?;
        if expected != values.len() as u64 {
            return Err(GgufWriterError::ShapeMismatch {
                name,
                shape: shape.to_vec(),
                expected,
                found: values.len() as u64,
            });
        }
        self.tensors.push(PendingTensor {
            name,
            shape: shape.to_vec(),
            ttype,
            values,
        });
        Ok(())
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    /// Serialize the accumulated model into `dest` and return the total
    /// number of bytes written. Any I/O failure aborts the whole write;
    /// callers needing atomicity should target a temporary path and rename.
    pub fn write(&self, dest: &mut impl Write) -> Result<u64> {
        let layout = self.layout();
        let head = self.encode_head(&layout);
        dest.write_all(&head)?;

        // data section: every tensor starts at its precomputed relative
        // offset, zero-filling the alignment gap left by the previous one
        let mut position = 0u64;
        for (tensor, entry) in self.tensors.iter().zip(&layout) {
            if entry.offset > position {
                write_zeros(dest, entry.offset - position)?;
                position = entry.offset;
            }
            let data = encode_tensor_data(tensor)?;
            debug_assert_eq!(data.len() as u64, entry.size);
            dest.write_all(&data)?;
            position += data.len() as u64;
            debug!(
                tensor = %tensor.name,
                dtype = %tensor.ttype,
                offset = entry.offset,
                bytes = entry.size,
                "tensor data written"
            );
        }
        Ok(head.len() as u64 + position)
    }

    /// Write the model to `path`, logging a summary on success.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let total = self.write(&mut writer)?;
        writer.flush()?;
        info!(
            artifact = %path.display(),
            tensors = self.tensors.len(),
            metadata = self.metadata.len(),
            bytes = total,
            "gguf file written"
        );
        Ok(total)
    }

    /// Assign per-tensor sizes and relative data-section offsets in one
    /// forward pass. Each offset is the previous tensor's end rounded up
    /// to the next 32-byte boundary, so every tensor starts aligned.
    fn layout(&self) -> Vec<LayoutEntry> {
        let mut offset = 0u64;
        self.tensors
            .iter()
            .map(|tensor| {
                let size = tensor.ttype.byte_size(tensor.values.len());
                let entry = LayoutEntry { offset, size };
                offset = (offset + size).next_multiple_of(GGUF_ALIGNMENT);
                entry
            })
            .collect()
    }

    /// Header + metadata + tensor descriptors, padded with zeros so the
    /// data section starts on a 32-byte boundary.
    fn encode_head(&self, layout: &[LayoutEntry]) -> Vec<u8> {
        let mut head = Vec::new();
        head.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        head.extend_from_slice(&GGUF_VERSION.to_le_bytes());
        head.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        head.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());
        for (key, value) in &self.metadata {
            encode_string(&mut head, key);
            value.encode(&mut head);
        }
        for (tensor, entry) in self.tensors.iter().zip(layout) {
            encode_string(&mut head, &tensor.name);
            head.extend_from_slice(&(tensor.shape.len() as u32).to_le_bytes());
            for &dim in &tensor.shape {
                head.extend_from_slice(&dim.to_le_bytes());
            }
            head.extend_from_slice(&tensor.ttype.as_u32().to_le_bytes());
            head.extend_from_slice(&entry.offset.to_le_bytes());
        }
        let padded = head.len().next_multiple_of(GGUF_ALIGNMENT as usize);
        head.resize(padded, 0);
        head
    }
}

fn encode_tensor_data(tensor: &PendingTensor) -> Result<Vec<u8>> {
    let bytes = match tensor.ttype {
        TensorType::F32 => {
            let mut out = Vec::with_capacity(tensor.values.len() * 4);
            for v in &tensor.values {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out
        }
        TensorType::F16 => {
            let mut out = Vec::with_capacity(tensor.values.len() * 2);
            for &v in &tensor.values {
                out.extend_from_slice(&f16::from_f32(v).to_le_bytes());
            }
            out
        }
        TensorType::Q8_0 => quantize_q8_0(&tensor.values)?,
        TensorType::Q4K => quantize_q4_k(&tensor.values)?,
    };
    Ok(bytes)
}

fn write_zeros(dest: &mut impl Write, count: u64) -> io::Result<()> {
    const ZEROS: [u8; 64] = [0u8; 64];
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        dest.write_all(&ZEROS[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
