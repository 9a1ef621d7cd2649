//! Wire-level initializer replacement.
//!
//! The model is walked as raw protobuf fields. Only the graph message and the
//! initializers being replaced are re-encoded; every other byte is copied from
//! the source file, including fields this crate has no message type for.

use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use prost::Message;
use tracing::{debug, warn};

use super::dtype_from_onnx;
use super::proto::{tags, tensor_proto, TensorProto};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::ir::WeightStore;

struct Field<'a> {
    tag: u32,
    wire_type: WireType,
    /// Key and payload exactly as they appear in the source.
    raw: &'a [u8],
    /// Payload without key, and without length prefix for delimited fields.
    payload: &'a [u8],
}

impl Field<'_> {
    fn is_message(&self, tag: u32) -> bool {
        self.tag == tag && self.wire_type == WireType::LengthDelimited
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(Error::invalid(Format::Onnx, "truncated protobuf field"));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn fields(mut buf: &[u8]) -> Result<Vec<Field<'_>>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let start = buf;
        let (tag, wire_type) = decode_key(&mut buf)?;
        let payload = match wire_type {
            WireType::Varint => {
                let before = buf;
                decode_varint(&mut buf)?;
                &before[..before.len() - buf.len()]
            }
            WireType::SixtyFourBit => take(&mut buf, 8)?,
            WireType::ThirtyTwoBit => take(&mut buf, 4)?,
            WireType::LengthDelimited => {
                let len = decode_varint(&mut buf)? as usize;
                take(&mut buf, len)?
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(Error::invalid(
                    Format::Onnx,
                    format!("unsupported group encoding in field {}", tag),
                ))
            }
        };
        out.push(Field {
            tag,
            wire_type,
            raw: &start[..start.len() - buf.len()],
            payload,
        });
    }
    Ok(out)
}

fn write_message(out: &mut Vec<u8>, tag: u32, payload: &[u8]) {
    encode_key(tag, WireType::LengthDelimited, out);
    encode_varint(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// Returns the patched model and how many initializers were replaced.
pub fn replace_initializers(model: &[u8], weights: &WeightStore) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(model.len());
    let mut replaced = 0;
    for field in fields(model)? {
        if field.is_message(tags::MODEL_GRAPH) {
            let graph = patch_graph(field.payload, weights, &mut replaced)?;
            write_message(&mut out, tags::MODEL_GRAPH, &graph);
        } else {
            out.extend_from_slice(field.raw);
        }
    }
    Ok((out, replaced))
}

fn patch_graph(graph: &[u8], weights: &WeightStore, replaced: &mut usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(graph.len());
    for field in fields(graph)? {
        if field.is_message(tags::GRAPH_INITIALIZER) {
            if let Some(tensor) = patch_tensor(field.payload, weights)? {
                write_message(&mut out, tags::GRAPH_INITIALIZER, &tensor);
                *replaced += 1;
                continue;
            }
        }
        out.extend_from_slice(field.raw);
    }
    Ok(out)
}

fn patch_tensor(tensor: &[u8], weights: &WeightStore) -> Result<Option<Vec<u8>>> {
    let fields = fields(tensor)?;
    // The last occurrence of a scalar field wins.
    let name = match fields.iter().rev().find(|f| f.is_message(tags::TENSOR_NAME)) {
        Some(field) => std::str::from_utf8(field.payload)
            .map_err(|_| Error::invalid(Format::Onnx, "initializer name is not UTF-8"))?,
        None => return Ok(None),
    };
    let stored = match weights.get(name) {
        Some(stored) => stored,
        None => return Ok(None),
    };

    let header = TensorProto::decode(tensor)?;
    if header.data_location == Some(tensor_proto::DataLocation::External as i32) {
        warn!(name, "initializer is stored externally, leaving it untouched");
        return Ok(None);
    }
    let dims: Vec<usize> = header.dims.iter().map(|&d| d.max(0) as usize).collect();
    let data_type = header.data_type.and_then(dtype_from_onnx);
    if dims != stored.shape || data_type != Some(stored.data_type) {
        return Err(Error::ShapeMismatch {
            name: name.to_string(),
            expected: format!(
                "{:?} {}",
                dims,
                data_type.map_or("unsupported dtype".to_string(), |t| t.to_string())
            ),
            actual: format!("{:?} {}", stored.shape, stored.data_type),
        });
    }

    let mut out = Vec::with_capacity(tensor.len() + stored.data.len());
    for field in &fields {
        if field.tag == tags::TENSOR_RAW_DATA || tags::TENSOR_TYPED_DATA.contains(&field.tag) {
            continue;
        }
        out.extend_from_slice(field.raw);
    }
    write_message(&mut out, tags::TENSOR_RAW_DATA, &stored.data);
    debug!(name, bytes = stored.data.len(), "replaced initializer");
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Tensor};

    #[test]
    fn test_unknown_fields_survive() {
        // field 20 (varint 5), field 21 (fixed32), field 22 (bytes "ab")
        let model = [0xa0, 0x01, 0x05, 0xad, 0x01, 1, 2, 3, 4, 0xb2, 0x01, 2, b'a', b'b'];
        let (patched, replaced) = replace_initializers(&model, &WeightStore::new()).unwrap();
        assert_eq!(patched, model);
        assert_eq!(replaced, 0);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(replace_initializers(&[0x3a, 0x10, 0x00], &WeightStore::new()).is_err());
    }

    #[test]
    fn test_shape_change_is_rejected() {
        let init = TensorProto {
            name: Some("w".to_string()),
            dims: vec![2],
            data_type: Some(tensor_proto::DataType::Float as i32),
            raw_data: Some(vec![0; 8]),
            ..Default::default()
        };
        let mut weights = WeightStore::new();
        weights
            .insert(Tensor {
                name: "w".to_string(),
                shape: vec![1],
                data_type: DataType::F32,
                data: vec![0; 4],
            })
            .unwrap();
        let result = patch_tensor(&init.encode_to_vec(), &weights);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
