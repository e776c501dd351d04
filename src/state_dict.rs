use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use candle_core::pickle::PthTensors;
use onnx_graph::tensor::{DType, Shape, Tensor};
use onnx_graph::weights::{PthTensor, SafetensorsFile, SafetensorsTensor};
use crate::config::DISTRIBUTED_PREFIX;
use crate::Error;

/// Strips every leading `module.` left by data-parallel wrappers.
pub fn normalize_key(key: &str) -> &str {
    let mut key = key;
    while let Some(rest) = key.strip_prefix(DISTRIBUTED_PREFIX) {
        key = rest;
    }
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CheckpointFormat {
    PyTorchZip,
    Safetensors,
}

impl CheckpointFormat {
    pub fn detect(path: &Path) -> Result<Self, Error> {
        let mut head = [0u8; 9];
        let mut file = File::open(path)?;
        let mut filled = 0;
        while filled < head.len() {
            let n = file.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled >= 4 && head[..4] == *b"PK\x03\x04" {
            return Ok(CheckpointFormat::PyTorchZip);
        }
        if filled == head.len() && head[8] == b'{' {
            let header_len = u64::from_le_bytes([head[0], head[1], head[2], head[3], head[4], head[5], head[6], head[7]]);
            if header_len > 1 && header_len < 100_000_000 {
                return Ok(CheckpointFormat::Safetensors);
            }
        }
        Err(Error::UnknownCheckpointFormat(path.to_path_buf()))
    }
}

enum CheckpointSource {
    Pth(Arc<PthTensors>),
    Safetensors(Arc<SafetensorsFile>),
}

#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    /// Key as stored in the file, before normalization.
    pub key: String,
    pub dtype: DType,
    pub shape: Shape,
}

/// Parameter name to tensor mapping of a checkpoint, keyed by normalized name.
/// Tensor data stays on disk until a graph is written.
pub struct StateDict {
    format: CheckpointFormat,
    source: CheckpointSource,
    entries: BTreeMap<String, CheckpointEntry>,
}

impl StateDict {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let format = CheckpointFormat::detect(path)?;
        log::debug!("Reading {} as {format}", path.display());
        match format {
            CheckpointFormat::PyTorchZip => Self::from_pth(path),
            CheckpointFormat::Safetensors => Self::from_safetensors(path),
        }
    }

    pub fn from_pth(path: &Path) -> Result<Self, Error> {
        let tensors = PthTensors::new(path, None)?;
        let mut raw = vec![];
        for (key, info) in tensors.tensor_infos() {
            match DType::from_candle(info.dtype) {
                Ok(dtype) => raw.push(CheckpointEntry {
                    key: key.clone(),
                    dtype,
                    shape: Shape::from(info.layout.shape()),
                }),
                Err(_) => log::debug!("Skipping {key} with unsupported dtype {:?}", info.dtype),
            }
        }
        Ok(Self::assemble(CheckpointFormat::PyTorchZip, CheckpointSource::Pth(Arc::new(tensors)), raw))
    }

    pub fn from_safetensors(path: &Path) -> Result<Self, Error> {
        let file = SafetensorsFile::open(path)?;
        let raw = file.tensor_shapes().into_iter()
            .map(|(key, dtype, shape)| CheckpointEntry { key, dtype, shape })
            .collect();
        Ok(Self::assemble(CheckpointFormat::Safetensors, CheckpointSource::Safetensors(file), raw))
    }

    fn assemble(format: CheckpointFormat, source: CheckpointSource, mut raw: Vec<CheckpointEntry>) -> Self {
        // Shortest key first, so an unwrapped key wins over its `module.` twin.
        raw.sort_by(|a, b| (a.key.len(), &a.key).cmp(&(b.key.len(), &b.key)));
        let mut entries: BTreeMap<String, CheckpointEntry> = BTreeMap::new();
        for entry in raw {
            let name = normalize_key(&entry.key).to_string();
            if let Some(existing) = entries.get(&name) {
                log::warn!("Checkpoint keys {} and {} both normalize to {name}, keeping {}", existing.key, entry.key, existing.key);
                continue;
            }
            entries.insert(name, entry);
        }
        Self { format, source, entries }
    }

    pub fn format(&self) -> CheckpointFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|x| x.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointEntry> {
        self.entries.get(name)
    }

    /// A lazily read graph weight named `name`.
    pub fn tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let entry = self.entries.get(name)
            .ok_or_else(|| onnx_graph::Error::NoSuchTensorError(name.to_string()))?;
        let tensor: Arc<dyn Tensor> = match &self.source {
            CheckpointSource::Pth(tensors) => {
                let info = tensors.tensor_infos().get(&entry.key)
                    .ok_or_else(|| onnx_graph::Error::NoSuchTensorError(entry.key.clone()))?;
                PthTensor::new(name.to_string(), info.clone(), tensors.clone())?
            }
            CheckpointSource::Safetensors(file) => SafetensorsTensor::new(name.to_string(), file.clone(), &entry.key)?,
        };
        Ok(tensor)
    }
}
