//! Block quantization codec: pure transforms between flat `f32` buffers
//! and fixed-size quantized blocks, with the paired dequantization path.
//!
//! Two formats are supported:
//!
//! - **Q8_0**: 32 floats per block, stored as one `f16` scale plus 32
//!   signed bytes (34 bytes per block).
//! - **Q4_K** (simplified): 256 floats per super-block, stored as an `f16`
//!   overall scale `d`, an `f16` overall minimum `dmin`, 8 per-sub-block
//!   scale bytes and 128 bytes of packed nibbles (144 bytes per block).
//!   This is a self-contained variant of the K-quant layout, not
//!   bit-compatible with the llama.cpp kernels.
//!
//! Inputs of any non-zero length are accepted; the final partial block is
//! completed with zero padding, which the descriptor-declared element
//! count drops again on read.

use half::f16;
use thiserror::Error;

/// Elements per Q8_0 block.
pub const Q8_0_BLOCK: usize = 32;
/// On-disk bytes per Q8_0 block: `f16` scale + 32 signed bytes.
pub const Q8_0_BLOCK_BYTES: usize = 34;
/// Elements per Q4_K super-block.
pub const Q4_K_BLOCK: usize = 256;
/// On-disk bytes per Q4_K super-block.
pub const Q4_K_BLOCK_BYTES: usize = 144;

const Q4_K_SUB_BLOCK: usize = 32;
const Q4_K_SUB_BLOCKS: usize = 8;

/// Errors produced by the codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantError {
    #[error("cannot transform an empty buffer")]
    EmptyInput,
    #[error("buffer holds {found} bytes but {elements} elements require {expected}")]
    LengthMismatch {
        elements: usize,
        expected: usize,
        found: usize,
    },
}

pub type Result<T> = std::result::Result<T, QuantError>;

/// Quantize `values` into Q8_0 blocks.
///
/// Each 32-element block stores `scale = max(|x|) / 127` as `f16` followed
/// by `round(x / scale)` clamped to the signed byte range. An all-zero
/// block uses `scale = 1.0`, which keeps it lossless and avoids dividing
/// by zero. Output length is exactly `ceil(n / 32) * 34`.
pub fn quantize_q8_0(values: &[f32]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(QuantError::EmptyInput);
    }
    let blocks = values.len().div_ceil(Q8_0_BLOCK);
    let mut out = Vec::with_capacity(blocks * Q8_0_BLOCK_BYTES);
    for block in values.chunks(Q8_0_BLOCK) {
        let mut amax = 0f32;
        for &v in block {
            amax = amax.max(v.abs());
        }
        let scale = if amax > 0.0 { amax / 127.0 } else { 1.0 };
        out.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        let inv = 1.0 / scale;
        for idx in 0..Q8_0_BLOCK {
            // trailing pad elements of the last block quantize as zeros
            let v = block.get(idx).copied().unwrap_or(0.0);
            let q = (v * inv).round().clamp(-128.0, 127.0) as i32;
            out.push((q as i8) as u8);
        }
    }
    Ok(out)
}

/// Reconstruct the first `elements` floats from Q8_0 `bytes`.
pub fn dequantize_q8_0(bytes: &[u8], elements: usize) -> Result<Vec<f32>> {
    if elements == 0 {
        return Err(QuantError::EmptyInput);
    }
    let expected = elements.div_ceil(Q8_0_BLOCK) * Q8_0_BLOCK_BYTES;
    if bytes.len() != expected {
        return Err(QuantError::LengthMismatch {
            elements,
            expected,
            found: bytes.len(),
        });
    }
    let mut out = Vec::with_capacity(elements);
    for block in bytes.chunks_exact(Q8_0_BLOCK_BYTES) {
        let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
        for &b in &block[2..] {
            out.push((b as i8) as f32 * scale);
        }
    }
    out.truncate(elements);
    Ok(out)
}

/// Quantize `values` into simplified Q4_K super-blocks.
///
/// Per 256-element super-block: `d = max(|x|) / 127` over the whole block
/// (`1.0` when all-zero); each of the 8 sub-blocks of 32 gets
/// `scale_i = (max - min) / 15` and `min_i = min`, with the smallest
/// `min_i` stored as the shared `dmin`. Scale bytes encode
/// `round(scale_i / d * 63)` clamped to `[0, 63]`; elements encode
/// `round((x - min_i) / scale_i)` clamped to `[0, 15]` and pack two per
/// byte, first value in the low nibble. Output length is exactly
/// `ceil(n / 256) * 144`.
pub fn quantize_q4_k(values: &[f32]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(QuantError::EmptyInput);
    }
    let blocks = values.len().div_ceil(Q4_K_BLOCK);
    let mut out = Vec::with_capacity(blocks * Q4_K_BLOCK_BYTES);
    for chunk in values.chunks(Q4_K_BLOCK) {
        let mut block = [0f32; Q4_K_BLOCK];
        block[..chunk.len()].copy_from_slice(chunk);
        encode_super_block(&block, &mut out);
    }
    Ok(out)
}

fn encode_super_block(block: &[f32; Q4_K_BLOCK], out: &mut Vec<u8>) {
    let mut amax = 0f32;
    for &v in block {
        amax = amax.max(v.abs());
    }
    let d = if amax > 0.0 { amax / 127.0 } else { 1.0 };

    let mut scales = [0f32; Q4_K_SUB_BLOCKS];
    let mut mins = [0f32; Q4_K_SUB_BLOCKS];
    for (i, sub) in block.chunks_exact(Q4_K_SUB_BLOCK).enumerate() {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for &v in sub {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        scales[i] = (hi - lo) / 15.0;
        mins[i] = lo;
    }
    let dmin = mins.iter().copied().fold(f32::INFINITY, f32::min);

    out.extend_from_slice(&f16::from_f32(d).to_le_bytes());
    out.extend_from_slice(&f16::from_f32(dmin).to_le_bytes());
    for &s in &scales {
        out.push((s / d * 63.0).round().clamp(0.0, 63.0) as u8);
    }
    for (i, sub) in block.chunks_exact(Q4_K_SUB_BLOCK).enumerate() {
        let scale = if scales[i] != 0.0 { scales[i] } else { 1.0 };
        let mut pair = [0u8; 2];
        for (j, &v) in sub.iter().enumerate() {
            pair[j % 2] = ((v - mins[i]) / scale).round().clamp(0.0, 15.0) as u8;
            if j % 2 == 1 {
                out.push((pair[0] & 0x0F) | (pair[1] << 4));
            }
        }
    }
}

/// Reconstruct the first `elements` floats from Q4_K `bytes`.
///
/// Decoding reuses the super-block's shared `dmin` for all eight
/// sub-blocks instead of each sub-block's own minimum. That asymmetry is
/// inherited from the reference design and preserved on purpose;
/// downstream numeric comparisons depend on reproducing it exactly.
pub fn dequantize_q4_k(bytes: &[u8], elements: usize) -> Result<Vec<f32>> {
    if elements == 0 {
        return Err(QuantError::EmptyInput);
    }
    let expected = elements.div_ceil(Q4_K_BLOCK) * Q4_K_BLOCK_BYTES;
    if bytes.len() != expected {
        return Err(QuantError::LengthMismatch {
            elements,
            expected,
            found: bytes.len(),
        });
    }
    let mut out = Vec::with_capacity(elements);
    for block in bytes.chunks_exact(Q4_K_BLOCK_BYTES) {
        let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
        let dmin = f16::from_le_bytes([block[2], block[3]]).to_f32();
        let scale_bytes = &block[4..4 + Q4_K_SUB_BLOCKS];
        let packed = &block[12..];
        for (i, half_bytes) in packed.chunks_exact(Q4_K_SUB_BLOCK / 2).enumerate() {
            let scale = scale_bytes[i] as f32 / 63.0 * d;
            for &byte in half_bytes {
                out.push((byte & 0x0F) as f32 * scale + dmin);
                out.push((byte >> 4) as f32 * scale + dmin);
            }
        }
    }
    out.truncate(elements);
    Ok(out)
}
