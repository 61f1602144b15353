//! Storage-type selection for conversion drivers. Embedding, position,
//! class/mask token, normalization and bias tensors carry few parameters
//! and are sensitive to rounding, so they stay full precision regardless
//! of the requested quantization; everything else uses the caller's type.

use vision_gguf::TensorType;

const FULL_PRECISION_MARKERS: [&str; 7] = ["embed", "pos", "cls", "mask", "norm", "ln", "bias"];

/// Pick the storage type for a tensor by name pattern.
pub fn select_tensor_type(name: &str, requested: TensorType) -> TensorType {
    let lower = name.to_ascii_lowercase();
    if FULL_PRECISION_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        TensorType::F32
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_tensors_stay_full_precision() {
        for name in [
            "siglip.patch_embed.weight",
            "siglip.pos_embed",
            "dinov2.cls_token",
            "dinov2.mask_token",
            "siglip.blocks.3.ln1.weight",
            "siglip.norm.bias",
            "siglip.blocks.0.attn.q.bias",
        ] {
            assert_eq!(select_tensor_type(name, TensorType::Q8_0), TensorType::F32);
        }
    }

    #[test]
    fn other_tensors_use_the_requested_type() {
        assert_eq!(
            select_tensor_type("siglip.blocks.0.attn.q.weight", TensorType::Q8_0),
            TensorType::Q8_0
        );
        assert_eq!(
            select_tensor_type("siglip.blocks.0.mlp.fc1.weight", TensorType::Q4K),
            TensorType::Q4K
        );
    }
}
