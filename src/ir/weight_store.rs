//! Ordered name → tensor mapping persisted as a safetensors archive.
//!
//! safetensors sorts its header on write, so the insertion order is carried in
//! the `__metadata__` section under [`ORDER_KEY`]. Archives written elsewhere
//! fall back to data-offset order.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors, View};
use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};
use crate::format::Format;
use crate::ir::{DataType, Tensor};

pub const ORDER_KEY: &str = "tensor_order";

#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: Vec<Tensor>,
    index: HashMap<String, usize>,
    // Serialized form this store was read from, reused verbatim on write.
    encoded: Option<Vec<u8>>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: Tensor) -> Result<()> {
        if self.index.contains_key(&tensor.name) {
            return Err(Error::DuplicateTensor(tensor.name));
        }
        if tensor.data.len() != tensor.expected_len() {
            return Err(Error::ShapeMismatch {
                name: tensor.name.clone(),
                expected: format!(
                    "{} bytes for {:?} {}",
                    tensor.expected_len(),
                    tensor.shape,
                    tensor.data_type
                ),
                actual: format!("{} bytes", tensor.data.len()),
            });
        }
        self.encoded = None;
        self.index.insert(tensor.name.clone(), self.tensors.len());
        self.tensors.push(tensor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| Error::MissingTensor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tensor> {
        self.tensors.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tensors.iter().map(|t| t.name.as_str()).collect()
    }

    /// Lay the store out as a plain array list following `order`, e.g. the
    /// parameter declaration order of a model held by an aggregation server.
    pub fn to_ordered_arrays<S: AsRef<str>>(&self, order: &[S]) -> Result<Vec<&Tensor>> {
        order.iter().map(|name| self.require(name.as_ref())).collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }
        let order = serde_json::to_string(&self.names())?;
        let info = Some(HashMap::from([(ORDER_KEY.to_string(), order)]));
        let bytes = safetensors::tensor::serialize(
            self.tensors.iter().map(|t| (t.name.as_str(), t)),
            &info,
        )?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let archive = SafeTensors::deserialize(&bytes)?;

        let mut by_offset: Vec<(String, usize)> = header
            .tensors()
            .into_iter()
            .map(|(name, info)| (name, info.data_offsets.0))
            .collect();
        by_offset.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let offset_order: Vec<String> = by_offset.into_iter().map(|(name, _)| name).collect();

        let order = match header.metadata().as_ref().and_then(|m| m.get(ORDER_KEY)) {
            Some(raw) => {
                let recorded: Vec<String> = serde_json::from_str(raw)?;
                if same_names(&recorded, &offset_order) {
                    recorded
                } else {
                    warn!(
                        "recorded tensor order does not match archive contents, using offset order"
                    );
                    offset_order
                }
            }
            None => offset_order,
        };

        let mut store = WeightStore::new();
        for name in order {
            let view = archive.tensor(&name)?;
            store.insert(Tensor {
                name: name.clone(),
                shape: view.shape().to_vec(),
                data_type: from_safetensors_dtype(view.dtype())?,
                data: view.data().to_vec(),
            })?;
        }
        debug!(tensors = store.len(), "decoded weight store");
        store.encoded = Some(bytes);
        Ok(store)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).at(path)?;
        Self::from_bytes(bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes()?).at(path)
    }
}

fn same_names(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

impl<'a> View for &'a Tensor {
    fn dtype(&self) -> Dtype {
        to_safetensors_dtype(self.data_type)
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

fn to_safetensors_dtype(data_type: DataType) -> Dtype {
    match data_type {
        DataType::F64 => Dtype::F64,
        DataType::F32 => Dtype::F32,
        DataType::F16 => Dtype::F16,
        DataType::BF16 => Dtype::BF16,
        DataType::I64 => Dtype::I64,
        DataType::I32 => Dtype::I32,
        DataType::I16 => Dtype::I16,
        DataType::I8 => Dtype::I8,
        DataType::U64 => Dtype::U64,
        DataType::U32 => Dtype::U32,
        DataType::U16 => Dtype::U16,
        DataType::U8 => Dtype::U8,
        DataType::Bool => Dtype::BOOL,
        DataType::F8E4M3 => Dtype::F8_E4M3,
        DataType::F8E5M2 => Dtype::F8_E5M2,
    }
}

fn from_safetensors_dtype(dtype: Dtype) -> Result<DataType> {
    Ok(match dtype {
        Dtype::F64 => DataType::F64,
        Dtype::F32 => DataType::F32,
        Dtype::F16 => DataType::F16,
        Dtype::BF16 => DataType::BF16,
        Dtype::I64 => DataType::I64,
        Dtype::I32 => DataType::I32,
        Dtype::I16 => DataType::I16,
        Dtype::I8 => DataType::I8,
        Dtype::U64 => DataType::U64,
        Dtype::U32 => DataType::U32,
        Dtype::U16 => DataType::U16,
        Dtype::U8 => DataType::U8,
        Dtype::BOOL => DataType::Bool,
        Dtype::F8_E4M3 => DataType::F8E4M3,
        Dtype::F8_E5M2 => DataType::F8E5M2,
        other => {
            return Err(Error::invalid(
                Format::SafeTensors,
                format!("unsupported dtype {:?}", other),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn f32_tensor(name: &str, shape: Vec<usize>, values: &[f32]) -> Tensor {
        Tensor {
            name: name.to_string(),
            shape,
            data_type: DataType::F32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    #[test]
    fn test_insertion_order_survives_persistence() {
        let mut store = WeightStore::new();
        // Names and dtypes chosen so safetensors' own header order differs.
        store.insert(f32_tensor("zeta", vec![2], &[1.0, 2.0])).unwrap();
        store
            .insert(Tensor {
                name: "alpha".to_string(),
                shape: vec![1],
                data_type: DataType::I64,
                data: 7i64.to_le_bytes().to_vec(),
            })
            .unwrap();
        store.insert(f32_tensor("mid", vec![1, 1], &[3.0])).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        store.save(&path).unwrap();

        let loaded = WeightStore::load(&path).unwrap();
        assert_eq!(loaded.names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(loaded.require("alpha").unwrap().data, 7i64.to_le_bytes().to_vec());
        assert_eq!(loaded.require("mid").unwrap().shape, vec![1, 1]);
    }

    #[test]
    fn test_foreign_archive_uses_offset_order() {
        let a = f32_tensor("b_second", vec![1], &[2.0]);
        let b = f32_tensor("a_first", vec![1], &[1.0]);
        let bytes = safetensors::tensor::serialize(
            vec![("b_second", &a), ("a_first", &b)],
            &None,
        )
        .unwrap();

        let store = WeightStore::from_bytes(bytes).unwrap();
        // Same dtype, so safetensors laid the data out by name.
        assert_eq!(store.names(), vec!["a_first", "b_second"]);
    }

    #[test]
    fn test_loaded_store_reencodes_verbatim() {
        let a = f32_tensor("w", vec![2], &[1.0, -1.0]);
        let mut info = HashMap::new();
        info.insert("format".to_string(), "pt".to_string());
        let bytes = safetensors::tensor::serialize(vec![("w", &a)], &Some(info)).unwrap();

        let store = WeightStore::from_bytes(bytes.clone()).unwrap();
        assert_eq!(store.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_duplicate_and_malformed_tensors_rejected() {
        let mut store = WeightStore::new();
        store.insert(f32_tensor("w", vec![1], &[1.0])).unwrap();
        assert!(matches!(
            store.insert(f32_tensor("w", vec![1], &[2.0])),
            Err(Error::DuplicateTensor(_))
        ));

        let short = Tensor {
            name: "short".to_string(),
            shape: vec![4],
            data_type: DataType::F32,
            data: vec![0; 3],
        };
        assert!(matches!(store.insert(short), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_ordered_arrays_follow_target_order() {
        let mut store = WeightStore::new();
        store.insert(f32_tensor("fc.weight", vec![1], &[1.0])).unwrap();
        store.insert(f32_tensor("fc.bias", vec![1], &[2.0])).unwrap();

        let arrays = store.to_ordered_arrays(&["fc.bias", "fc.weight"]).unwrap();
        assert_eq!(arrays[0].name, "fc.bias");
        assert_eq!(arrays[1].name, "fc.weight");

        assert!(matches!(
            store.to_ordered_arrays(&["fc.missing"]),
            Err(Error::MissingTensor(name)) if name == "fc.missing"
        ));
    }
}
