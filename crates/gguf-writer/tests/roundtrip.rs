//! End-to-end check: build a small vision-encoder export, write it to
//! disk, re-open it with the validating reader and verify metadata,
//! layout and tensor payloads including dequantization accuracy.

use half::f16;
use vision_gguf::{GgufReader, MetadataArray, MetadataValue, TensorType, GGUF_ALIGNMENT};
use vision_gguf_quant::{dequantize_q4_k, dequantize_q8_0};
use vision_gguf_writer::{select_tensor_type, GgufWriter};

fn ramp(n: usize, step: f32, base: f32) -> Vec<f32> {
    (0..n).map(|i| i as f32 * step + base).collect()
}

#[test]
fn full_export_round_trip() {
    let mut writer = GgufWriter::new();
    writer.add_metadata("general.architecture", "siglip".into());
    writer.add_metadata("vision.layer_count", MetadataValue::U32(2));
    writer.add_metadata("vision.patch_size", MetadataValue::U8(16));
    writer.add_metadata("vision.use_bias", MetadataValue::Bool(true));
    writer.add_metadata("vision.eps", MetadataValue::F32(1e-6));
    writer.add_metadata("vision.rope_theta", MetadataValue::F64(10000.0));
    writer.add_metadata("vision.shift", MetadataValue::I64(-4));
    writer.add_metadata(
        "vision.image_mean",
        MetadataValue::Array(MetadataArray::f32s([0.5, 0.5, 0.5])),
    );
    writer.add_metadata(
        "tokenizer.tokens",
        MetadataValue::Array(MetadataArray::strings(["<pad>", "<bos>", "<eos>"])),
    );

    let embed = ramp(48, 0.125, -3.0);
    let attn = ramp(2048, 0.01, -10.0);
    let mlp = ramp(512, 0.05, -12.5);
    let head = ramp(40, 0.25, -5.0);

    writer
        .add_tensor(
            "siglip.patch_embed.weight",
            &[3, 16],
            select_tensor_type("siglip.patch_embed.weight", TensorType::Q8_0),
            embed.clone(),
        )
        .unwrap();
    writer
        .add_tensor(
            "siglip.blocks.0.attn.q.weight",
            &[64, 32],
            TensorType::Q8_0,
            attn.clone(),
        )
        .unwrap();
    writer
        .add_tensor(
            "siglip.blocks.0.mlp.fc1.weight",
            &[2, 256],
            TensorType::Q4K,
            mlp.clone(),
        )
        .unwrap();
    writer
        .add_tensor("siglip.head.weight", &[8, 5], TensorType::F16, head.clone())
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("siglip.gguf");
    let total = writer.write_to_path(&path).unwrap();
    assert_eq!(total, std::fs::metadata(&path).unwrap().len());

    let reader = GgufReader::open(&path).unwrap();
    assert_eq!(reader.header().tensor_count, 4);
    assert_eq!(reader.header().metadata_count, 9);

    // metadata comes back in insertion order with its declared widths
    let keys: Vec<&str> = reader.metadata().iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        keys,
        [
            "general.architecture",
            "vision.layer_count",
            "vision.patch_size",
            "vision.use_bias",
            "vision.eps",
            "vision.rope_theta",
            "vision.shift",
            "vision.image_mean",
            "tokenizer.tokens",
        ]
    );
    assert_eq!(
        reader.metadata_value("vision.patch_size"),
        Some(&MetadataValue::U8(16))
    );
    assert_eq!(
        reader.metadata_value("vision.shift"),
        Some(&MetadataValue::I64(-4))
    );

    // layout: monotonically increasing 32-byte-aligned offsets
    let mut previous_end = 0;
    for info in reader.tensors() {
        assert_eq!(info.offset % GGUF_ALIGNMENT, 0, "{}", info.name);
        assert!(info.offset >= previous_end, "{}", info.name);
        previous_end = info.offset + info.byte_size();
    }

    // exempted tensor was stored raw and byte-identical
    let embed_info = reader.tensor("siglip.patch_embed.weight").unwrap();
    assert_eq!(embed_info.ttype, TensorType::F32);
    let embed_bytes = reader.tensor_bytes(embed_info).unwrap();
    let decoded: Vec<f32> = embed_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(decoded, embed);

    // Q8_0 payload dequantizes within one step per block
    let attn_info = reader.tensor("siglip.blocks.0.attn.q.weight").unwrap();
    let attn_bytes = reader.tensor_bytes(attn_info).unwrap();
    assert_eq!(attn_bytes.len(), (2048 / 32) * 34);
    let attn_back = dequantize_q8_0(attn_bytes, 2048).unwrap();
    for (block_idx, block) in attn.chunks(32).enumerate() {
        let amax = block.iter().fold(0f32, |acc, v| acc.max(v.abs()));
        let bound = amax / 127.0 + 1e-6;
        for (orig, dec) in block.iter().zip(&attn_back[block_idx * 32..]) {
            assert!((orig - dec).abs() <= bound);
        }
    }

    // Q4_K payload has the right geometry and decodes to the right count
    let mlp_info = reader.tensor("siglip.blocks.0.mlp.fc1.weight").unwrap();
    let mlp_bytes = reader.tensor_bytes(mlp_info).unwrap();
    assert_eq!(mlp_bytes.len(), 2 * 144);
    let mlp_back = dequantize_q4_k(mlp_bytes, 512).unwrap();
    assert_eq!(mlp_back.len(), 512);

    // F16 payload narrows each element
    let head_info = reader.tensor("siglip.head.weight").unwrap();
    let head_bytes = reader.tensor_bytes(head_info).unwrap();
    for (chunk, &v) in head_bytes.chunks_exact(2).zip(&head) {
        assert_eq!(
            f16::from_le_bytes([chunk[0], chunk[1]]),
            f16::from_f32(v),
        );
    }
}

#[test]
fn quantized_tensor_with_partial_final_block() {
    // 40 elements: one full Q8_0 block plus a zero-padded tail block. The
    // descriptor keeps the true element count and the reader's geometry
    // accounts for the padded block.
    let values = ramp(40, 1.0, 0.0);
    let mut writer = GgufWriter::new();
    writer
        .add_tensor("t", &[40], TensorType::Q8_0, values)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.gguf");
    writer.write_to_path(&path).unwrap();

    let reader = GgufReader::open(&path).unwrap();
    let info = reader.tensor("t").unwrap();
    assert_eq!(info.elements(), 40);
    assert_eq!(info.byte_size(), 2 * 34);
    let bytes = reader.tensor_bytes(info).unwrap();
    let back = dequantize_q8_0(bytes, 40).unwrap();
    assert_eq!(back.len(), 40);
}
