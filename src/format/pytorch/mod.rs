//! State-dict checkpoints in the zip layout written by `torch.save`.
//!
//! ```text
//! archive/data.pkl        pickled object graph
//! archive/byteorder       "little"
//! archive/data/<key>      raw storage bytes, one record per storage
//! archive/version         "3\n"
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};

use serde_json::{Number, Value};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, IoContext, Result};
use crate::format::{foreign_descriptor, CheckpointFormat, Format};
use crate::ir::{
    sanitize, Architecture, DataType, Metadata, ModelIR, StateDictLayout, Tensor, ToMetadata,
    WeightStore,
};

pub mod pickle;

use pickle::{read_pickle, Object, PickleWriter};

const ARCHIVE_NAME: &str = "archive";
const STORAGE_ALIGNMENT: u16 = 64;

pub struct PytorchFormat {
    nested_keys: Vec<String>,
}

impl PytorchFormat {
    /// `nested_keys` are tried in order when looking for a nested state dict.
    pub fn new(nested_keys: Vec<String>) -> Self {
        Self { nested_keys }
    }
}

impl Default for PytorchFormat {
    fn default() -> Self {
        Self::new(vec!["state_dict".to_string(), "model_state_dict".to_string()])
    }
}

impl CheckpointFormat for PytorchFormat {
    fn format(&self) -> Format {
        Format::PyTorch
    }

    fn extract(&self, path: &Path) -> Result<ModelIR> {
        let root = load_checkpoint(path)?;
        let entries = match root {
            Object::Dict(entries) => entries
                .into_iter()
                .map(|(k, v)| (key_string(k), v))
                .collect::<Vec<_>>(),
            other => {
                return Err(Error::invalid(
                    Format::PyTorch,
                    format!("top-level object is not a mapping: {}", other),
                ))
            }
        };

        let layout = classify(&entries, &self.nested_keys);
        debug!(?layout, "classified checkpoint");

        let (tensors, rest) = match &layout {
            StateDictLayout::Nested { key } => {
                let mut tensors = Vec::new();
                let mut rest = Vec::new();
                for (k, v) in entries {
                    if &k != key {
                        rest.push((k, v));
                        continue;
                    }
                    if let Object::Dict(inner) = v {
                        for (name, value) in inner {
                            let name = key_string(name);
                            match value {
                                Object::Tensor(t) => tensors.push((name, t)),
                                other => warn!(
                                    key = %name,
                                    value = %other,
                                    "dropping non-tensor entry of nested state dict"
                                ),
                            }
                        }
                    }
                }
                (tensors, rest)
            }
            StateDictLayout::Flat | StateDictLayout::Mixed => {
                let mut tensors = Vec::new();
                let mut rest = Vec::new();
                for (k, v) in entries {
                    match v {
                        Object::Tensor(t) => tensors.push((k, t)),
                        other => rest.push((k, other)),
                    }
                }
                (tensors, rest)
            }
        };

        let mut weights = WeightStore::new();
        for (name, tensor) in tensors {
            weights.insert(tensor.with_name(name))?;
        }

        let mut metadata = Metadata::new();
        for (key, value) in rest {
            let json = sanitize(&key, &value);
            metadata.insert(key, json);
        }

        info!(
            path = %path.display(),
            tensors = weights.len(),
            metadata = metadata.len(),
            "extracted torch checkpoint"
        );
        let architecture = Architecture::StateDict {
            tensor_keys: weights.names().into_iter().map(String::from).collect(),
            layout,
        };
        Ok(ModelIR::new(weights, architecture, metadata))
    }

    fn rebuild(&self, ir: &ModelIR, output: &Path) -> Result<()> {
        let (tensor_keys, layout) = match &ir.architecture {
            Architecture::StateDict {
                tensor_keys,
                layout,
            } => (tensor_keys, layout),
            other => return Err(foreign_descriptor(self.format(), other)),
        };

        let mut storages: Vec<&[u8]> = Vec::with_capacity(tensor_keys.len());
        let mut tensors = Vec::with_capacity(tensor_keys.len());
        for key in tensor_keys {
            let tensor = ir.weights.require(key)?;
            tensors.push((
                Object::String(key.clone()),
                tensor_object(tensor, storages.len()),
            ));
            storages.push(&tensor.data);
        }

        let mut entries = Vec::new();
        match layout {
            StateDictLayout::Nested { key } => {
                entries.push((Object::String(key.clone()), ordered_dict(tensors)));
                for (k, v) in &ir.metadata {
                    if k == key {
                        warn!(
                            key = %k,
                            "metadata entry collides with the nested state dict key, skipping"
                        );
                        continue;
                    }
                    entries.push((Object::String(k.clone()), from_json(v)));
                }
            }
            StateDictLayout::Flat | StateDictLayout::Mixed => {
                entries = tensors;
                for (k, v) in &ir.metadata {
                    entries.push((Object::String(k.clone()), from_json(v)));
                }
            }
        }

        // A bare state dict round-trips as the OrderedDict torch produced.
        let root = if *layout == StateDictLayout::Flat && ir.metadata.is_empty() {
            ordered_dict(entries)
        } else {
            Object::Dict(entries)
        };

        write_archive(output, &root, &storages)?;
        info!(path = %output.display(), tensors = storages.len(), "wrote torch checkpoint");
        Ok(())
    }
}

/// Decide where the tensor set lives. Branches are tried in a fixed order and
/// the first match is final.
pub fn classify(entries: &[(String, Object)], nested_keys: &[String]) -> StateDictLayout {
    for key in nested_keys {
        let nested = entries
            .iter()
            .any(|(k, v)| k == key && matches!(v, Object::Dict(_)));
        if nested {
            return StateDictLayout::Nested { key: key.clone() };
        }
    }
    if entries.iter().all(|(_, v)| matches!(v, Object::Tensor(_))) {
        StateDictLayout::Flat
    } else {
        StateDictLayout::Mixed
    }
}

fn key_string(key: Object) -> String {
    match key {
        Object::String(s) => s,
        other => other.to_string(),
    }
}

/// Read a torch zip archive and resolve every tensor against its storage.
pub fn load_checkpoint(path: &Path) -> Result<Object> {
    let file = File::open(path).at(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| {
        Error::invalid(
            Format::PyTorch,
            format!("{} is not a zip-based torch archive: {}", path.display(), e),
        )
    })?;

    let pkl_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| Error::invalid(Format::PyTorch, "data.pkl not found in archive"))?;
    let prefix = pkl_name.trim_end_matches("data.pkl").to_string();

    let mut pkl_data = Vec::new();
    archive.by_name(&pkl_name)?.read_to_end(&mut pkl_data).at(path)?;
    let object = read_pickle(&mut pkl_data.as_slice())?;

    let mut storages = Storages {
        archive,
        prefix,
        path: path.to_path_buf(),
        cache: HashMap::new(),
    };
    resolve(object, &mut storages)
}

struct Storages<R> {
    archive: ZipArchive<R>,
    prefix: String,
    path: PathBuf,
    cache: HashMap<String, Vec<u8>>,
}

impl<R: Read + Seek> Storages<R> {
    fn read(&mut self, key: &str) -> Result<&[u8]> {
        if !self.cache.contains_key(key) {
            let name = format!("{}data/{}", self.prefix, key);
            let mut entry = self.archive.by_name(&name).map_err(|_| {
                Error::invalid(Format::PyTorch, format!("storage record '{}' missing", name))
            })?;
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).at(&self.path)?;
            drop(entry);
            self.cache.insert(key.to_string(), data);
        }
        Ok(self.cache[key].as_slice())
    }
}

fn resolve<R: Read + Seek>(object: Object, storages: &mut Storages<R>) -> Result<Object> {
    Ok(match object {
        Object::Reduce { callable, args } => {
            if callable.is_global("torch._utils", "_rebuild_tensor_v2") {
                Object::Tensor(rebuild_tensor(*args, storages)?)
            } else if callable.is_global("torch._utils", "_rebuild_parameter")
                || callable.is_global("torch._utils", "_rebuild_parameter_with_state")
            {
                match *args {
                    Object::Tuple(mut items) if !items.is_empty() => {
                        resolve(items.swap_remove(0), storages)?
                    }
                    other => {
                        return Err(Error::invalid(
                            Format::PyTorch,
                            format!("malformed parameter arguments {}", other),
                        ))
                    }
                }
            } else if callable.is_global("torch._tensor", "_rebuild_from_type_v2") {
                // (func, new_type, args, state): only the inner call matters.
                match *args {
                    Object::Tuple(mut items) if items.len() >= 3 => {
                        let inner_args = items.swap_remove(2);
                        let func = items.swap_remove(0);
                        resolve(
                            Object::Reduce {
                                callable: Box::new(func),
                                args: Box::new(inner_args),
                            },
                            storages,
                        )?
                    }
                    other => {
                        return Err(Error::invalid(
                            Format::PyTorch,
                            format!("malformed _rebuild_from_type_v2 arguments {}", other),
                        ))
                    }
                }
            } else {
                Object::Reduce {
                    callable,
                    args: Box::new(resolve(*args, storages)?),
                }
            }
        }
        Object::Dict(entries) => Object::Dict(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, resolve(v, storages)?)))
                .collect::<Result<Vec<_>>>()?,
        ),
        Object::List(items) => Object::List(
            items
                .into_iter()
                .map(|o| resolve(o, storages))
                .collect::<Result<Vec<_>>>()?,
        ),
        Object::Tuple(items) => Object::Tuple(
            items
                .into_iter()
                .map(|o| resolve(o, storages))
                .collect::<Result<Vec<_>>>()?,
        ),
        Object::Build { target, state } => Object::Build {
            target: Box::new(resolve(*target, storages)?),
            state: Box::new(resolve(*state, storages)?),
        },
        other => other,
    })
}

fn storage_dtype(name: &str) -> Option<DataType> {
    Some(match name {
        "DoubleStorage" => DataType::F64,
        "FloatStorage" => DataType::F32,
        "HalfStorage" => DataType::F16,
        "BFloat16Storage" => DataType::BF16,
        "LongStorage" => DataType::I64,
        "IntStorage" => DataType::I32,
        "ShortStorage" => DataType::I16,
        "CharStorage" => DataType::I8,
        "ByteStorage" => DataType::U8,
        "BoolStorage" => DataType::Bool,
        "Float8_e4m3fnStorage" => DataType::F8E4M3,
        "Float8_e5m2Storage" => DataType::F8E5M2,
        _ => return None,
    })
}

fn storage_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::F64 => "DoubleStorage",
        DataType::F32 => "FloatStorage",
        DataType::F16 => "HalfStorage",
        DataType::BF16 => "BFloat16Storage",
        DataType::I64 | DataType::U64 => "LongStorage",
        DataType::I32 | DataType::U32 => "IntStorage",
        DataType::I16 | DataType::U16 => "ShortStorage",
        DataType::I8 => "CharStorage",
        DataType::U8 => "ByteStorage",
        DataType::Bool => "BoolStorage",
        DataType::F8E4M3 => "Float8_e4m3fnStorage",
        DataType::F8E5M2 => "Float8_e5m2Storage",
    }
}

fn usizes(object: &Object, what: &str) -> Result<Vec<usize>> {
    match object {
        Object::Tuple(items) | Object::List(items) => items
            .iter()
            .map(|item| match item {
                Object::Int(v) if *v >= 0 => Ok(*v as usize),
                other => Err(Error::invalid(
                    Format::PyTorch,
                    format!("{} contains {}", what, other),
                )),
            })
            .collect(),
        other => Err(Error::invalid(
            Format::PyTorch,
            format!("expected {} tuple, got {}", what, other),
        )),
    }
}

/// `_rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks, ...)`
fn rebuild_tensor<R: Read + Seek>(args: Object, storages: &mut Storages<R>) -> Result<Tensor> {
    let args = match args {
        Object::Tuple(args) if args.len() >= 4 => args,
        other => {
            return Err(Error::invalid(
                Format::PyTorch,
                format!("malformed _rebuild_tensor_v2 arguments {}", other),
            ))
        }
    };

    // ('storage', storage_type, key, location, numel)
    let pid = match &args[0] {
        Object::PersistentId(pid) => match pid.as_ref() {
            Object::Tuple(items) if items.len() >= 3 => items,
            other => {
                return Err(Error::invalid(
                    Format::PyTorch,
                    format!("unexpected persistent id {}", other),
                ))
            }
        },
        other => {
            return Err(Error::invalid(
                Format::PyTorch,
                format!("tensor storage is not a persistent id: {}", other),
            ))
        }
    };
    let type_name = match &pid[1] {
        Object::Global { name, .. } => name.as_str(),
        Object::String(name) => name.as_str(),
        other => {
            return Err(Error::invalid(
                Format::PyTorch,
                format!("unexpected storage type {}", other),
            ))
        }
    };
    let data_type = storage_dtype(type_name).ok_or_else(|| {
        Error::invalid(Format::PyTorch, format!("unsupported storage type {}", type_name))
    })?;
    let key = match &pid[2] {
        Object::String(key) => key.clone(),
        Object::Int(key) => key.to_string(),
        other => {
            return Err(Error::invalid(
                Format::PyTorch,
                format!("unexpected storage key {}", other),
            ))
        }
    };

    let offset = match &args[1] {
        Object::Int(v) if *v >= 0 => *v as usize,
        other => {
            return Err(Error::invalid(
                Format::PyTorch,
                format!("unexpected storage offset {}", other),
            ))
        }
    };
    let shape = usizes(&args[2], "shape")?;
    let stride = usizes(&args[3], "stride")?;
    if stride.len() != shape.len() {
        return Err(Error::invalid(
            Format::PyTorch,
            format!("stride {:?} does not match shape {:?}", stride, shape),
        ));
    }

    let storage = storages.read(&key)?;
    let data = gather(storage, offset, &shape, &stride, data_type.size()).ok_or_else(|| {
        Error::invalid(
            Format::PyTorch,
            format!(
                "view (offset {}, shape {:?}, stride {:?}) exceeds storage {} of {} bytes",
                offset,
                shape,
                stride,
                key,
                storage.len()
            ),
        )
    })?;

    Ok(Tensor {
        name: String::new(),
        shape,
        data_type,
        data,
    })
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Copy a strided view out of `storage` into a dense row-major buffer.
fn gather(
    storage: &[u8],
    offset: usize,
    shape: &[usize],
    stride: &[usize],
    elem: usize,
) -> Option<Vec<u8>> {
    let numel: usize = shape.iter().product();
    if numel == 0 {
        return Some(Vec::new());
    }
    if stride == contiguous_strides(shape).as_slice() {
        let start = offset * elem;
        let end = start + numel * elem;
        return storage.get(start..end).map(<[u8]>::to_vec);
    }

    let mut out = Vec::with_capacity(numel * elem);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..numel {
        let src = offset + index.iter().zip(stride).map(|(i, s)| i * s).sum::<usize>();
        out.extend_from_slice(storage.get(src * elem..(src + 1) * elem)?);
        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Some(out)
}

fn ordered_dict(entries: Vec<(Object, Object)>) -> Object {
    let args = if entries.is_empty() {
        Vec::new()
    } else {
        let pairs = entries
            .into_iter()
            .map(|(k, v)| Object::Tuple(vec![k, v]))
            .collect();
        vec![Object::List(pairs)]
    };
    Object::Reduce {
        callable: Box::new(Object::global("collections", "OrderedDict")),
        args: Box::new(Object::Tuple(args)),
    }
}

fn tensor_object(tensor: &Tensor, storage_key: usize) -> Object {
    let ints = |values: Vec<usize>| {
        Object::Tuple(values.into_iter().map(|v| Object::Int(v as i64)).collect())
    };
    let pid = Object::Tuple(vec![
        Object::String("storage".to_string()),
        Object::global("torch", storage_name(tensor.data_type)),
        Object::String(storage_key.to_string()),
        Object::String("cpu".to_string()),
        Object::Int(tensor.numel() as i64),
    ]);
    Object::Reduce {
        callable: Box::new(Object::global("torch._utils", "_rebuild_tensor_v2")),
        args: Box::new(Object::Tuple(vec![
            Object::PersistentId(Box::new(pid)),
            Object::Int(0),
            ints(tensor.shape.clone()),
            ints(contiguous_strides(&tensor.shape)),
            Object::Bool(false),
            ordered_dict(Vec::new()),
        ])),
    }
}

fn write_archive(path: &Path, root: &Object, storages: &[&[u8]]) -> Result<()> {
    let mut pickler = PickleWriter::new();
    pickler.write(root)?;
    let pkl = pickler.finish();

    let file = File::create(path).at(path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file(format!("{}/data.pkl", ARCHIVE_NAME), options)?;
    zip.write_all(&pkl).at(path)?;
    zip.start_file(format!("{}/byteorder", ARCHIVE_NAME), options)?;
    zip.write_all(b"little").at(path)?;
    for (key, data) in storages.iter().enumerate() {
        zip.start_file_aligned(
            format!("{}/data/{}", ARCHIVE_NAME, key),
            options,
            STORAGE_ALIGNMENT,
        )?;
        zip.write_all(data).at(path)?;
    }
    zip.start_file(format!("{}/version", ARCHIVE_NAME), options)?;
    zip.write_all(b"3\n").at(path)?;
    zip.finish()?;
    Ok(())
}

impl ToMetadata for Object {
    fn to_json(&self) -> Option<Value> {
        Some(match self {
            Object::None => Value::Null,
            Object::Bool(b) => Value::Bool(*b),
            Object::Int(i) => Value::Number((*i).into()),
            Object::Float(f) => Value::Number(Number::from_f64(*f)?),
            Object::String(s) => Value::String(s.clone()),
            Object::Tuple(items) | Object::List(items) => {
                Value::Array(items.iter().map(|o| o.to_json()).collect::<Option<_>>()?)
            }
            Object::Dict(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    // Scalar keys are coerced to strings, as Python's json module does.
                    let key = match k {
                        Object::String(s) => s.clone(),
                        Object::None | Object::Bool(_) | Object::Int(_) | Object::Float(_) => {
                            match k.to_json()? {
                                Value::String(s) => s,
                                other => other.to_string(),
                            }
                        }
                        _ => return None,
                    };
                    map.insert(key, v.to_json()?);
                }
                Value::Object(map)
            }
            _ => return None,
        })
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

/// Inverse of [`ToMetadata::to_json`] for values read back from metadata.
pub fn from_json(value: &Value) -> Object {
    match value {
        Value::Null => Object::None,
        Value::Bool(b) => Object::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Object::Int(i),
            None => Object::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Object::String(s.clone()),
        Value::Array(items) => Object::List(items.iter().map(from_json).collect()),
        Value::Object(map) => Object::Dict(
            map.iter()
                .map(|(k, v)| (Object::String(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}
