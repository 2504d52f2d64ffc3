//! Safetensors I/O for every array artifact the pipeline writes.
//!
//! Layout: `u64` little-endian header length, a JSON header mapping tensor
//! names to `{dtype, shape, data_offsets}`, then the raw little-endian
//! tensor bytes. Structured information (channel lists, drop logs, …) goes
//! into the standard `__metadata__` string map as JSON documents.
use anyhow::{bail, Context, Result};
use ndarray::{Array, Array2, Array3, Dimension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::recording::{Recording, RecordingInfo};

const METADATA_KEY: &str = "__metadata__";

// ── Writer ────────────────────────────────────────────────────────────────────

/// Safetensors file writer for F64 and I64 tensors plus JSON metadata.
///
/// ```rust,no_run
/// use meegprep::io::StWriter;
/// use std::path::Path;
/// let mut w = StWriter::new();
/// w.add_f64("signal", &[1.0, 2.0, 3.0], &[1, 3]);
/// w.add_meta("comment", &"three samples").unwrap();
/// w.write(Path::new("/tmp/out.safetensors")).unwrap();
/// ```
#[derive(Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: Map<String, Value>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    /// Add an n-d array in logical (row-major) order.
    pub fn add_array<D: Dimension>(&mut self, name: &str, arr: &Array<f64, D>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, arr.shape());
    }

    pub fn add_i64(&mut self, name: &str, data: &[i64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I64", shape.to_vec()));
    }

    /// Store `value` as a JSON string under `__metadata__[key]`.
    pub fn add_meta<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("serialising metadata `{key}`"))?;
        self.metadata.insert(key.to_string(), Value::String(json));
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        use std::io::Write;
        let mut header_map = Map::new();
        if !self.metadata.is_empty() {
            header_map.insert(METADATA_KEY.to_string(), Value::Object(self.metadata.clone()));
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;
        let padded: Vec<u8> = hdr_bytes
            .into_iter()
            .chain(std::iter::repeat(b' ').take(pad))
            .collect();
        let mut f = std::io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        );
        f.write_all(&(padded.len() as u64).to_le_bytes())?;
        f.write_all(&padded)?;
        for (_, data, _, _) in &self.entries {
            f.write_all(data)?;
        }
        f.flush()?;
        Ok(())
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// An in-memory safetensors file.
pub struct StReader {
    bytes: Vec<u8>,
    header: Map<String, Value>,
    data_start: usize,
}

impl StReader {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_bytes(bytes).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 8 {
            bail!("safetensors file too small");
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[..8]);
        let n = u64::from_le_bytes(len) as usize;
        if 8 + n > bytes.len() {
            bail!("header length {n} exceeds file size {}", bytes.len());
        }
        let header: Map<String, Value> = serde_json::from_slice(&bytes[8..8 + n])
            .context("failed to parse safetensors header")?;
        Ok(Self { bytes, header, data_start: 8 + n })
    }

    /// Tensor names in the file (metadata excluded).
    pub fn keys(&self) -> Vec<String> {
        self.header.keys().filter(|k| *k != METADATA_KEY).cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        name != METADATA_KEY && self.header.contains_key(name)
    }

    fn entry(&self, name: &str) -> Result<(&str, Vec<usize>, &[u8])> {
        let e = self
            .header
            .get(name)
            .filter(|_| name != METADATA_KEY)
            .with_context(|| format!("missing tensor `{name}`"))?;
        let dtype = e["dtype"].as_str().with_context(|| format!("`{name}`: no dtype"))?;
        let shape = e["shape"]
            .as_array()
            .with_context(|| format!("`{name}`: no shape"))?
            .iter()
            .map(|v| v.as_u64().map(|x| x as usize))
            .collect::<Option<Vec<usize>>>()
            .with_context(|| format!("`{name}`: bad shape"))?;
        let offsets = e["data_offsets"]
            .as_array()
            .with_context(|| format!("`{name}`: no data_offsets"))?;
        let (s, end) = match (offsets.first().and_then(Value::as_u64), offsets.get(1).and_then(Value::as_u64)) {
            (Some(s), Some(end)) => (s as usize, end as usize),
            _ => bail!("`{name}`: bad data_offsets"),
        };
        if s > end || self.data_start + end > self.bytes.len() {
            bail!("`{name}`: data_offsets out of bounds");
        }
        Ok((dtype, shape, &self.bytes[self.data_start + s..self.data_start + end]))
    }

    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.entry(name)?.1)
    }

    /// Read a floating-point tensor (F64 or F32) as f64.
    pub fn f64_tensor(&self, name: &str) -> Result<(Vec<f64>, Vec<usize>)> {
        let (dtype, shape, raw) = self.entry(name)?;
        let vals: Vec<f64> = match dtype {
            "F64" => raw
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
            "F32" => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            other => bail!("`{name}`: expected a float tensor, found {other}"),
        };
        let expected: usize = shape.iter().product();
        if vals.len() != expected {
            bail!("`{name}`: {} values for shape {:?}", vals.len(), shape);
        }
        Ok((vals, shape))
    }

    /// Read an integer tensor (I64 or I32) as i64.
    pub fn i64_tensor(&self, name: &str) -> Result<(Vec<i64>, Vec<usize>)> {
        let (dtype, shape, raw) = self.entry(name)?;
        let vals: Vec<i64> = match dtype {
            "I64" => raw
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
            "I32" => raw
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
                .collect(),
            other => bail!("`{name}`: expected an integer tensor, found {other}"),
        };
        Ok((vals, shape))
    }

    pub fn array2(&self, name: &str) -> Result<Array2<f64>> {
        let (vals, shape) = self.f64_tensor(name)?;
        if shape.len() != 2 {
            bail!("`{name}`: expected 2-D, got shape {:?}", shape);
        }
        Ok(Array2::from_shape_vec((shape[0], shape[1]), vals)?)
    }

    pub fn array3(&self, name: &str) -> Result<Array3<f64>> {
        let (vals, shape) = self.f64_tensor(name)?;
        if shape.len() != 3 {
            bail!("`{name}`: expected 3-D, got shape {:?}", shape);
        }
        Ok(Array3::from_shape_vec((shape[0], shape[1], shape[2]), vals)?)
    }

    /// Deserialize the JSON document stored under `__metadata__[key]`.
    pub fn meta<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let s = self
            .header
            .get(METADATA_KEY)
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .with_context(|| format!("missing metadata `{key}`"))?;
        serde_json::from_str(s).with_context(|| format!("parsing metadata `{key}`"))
    }
}

// ── Recordings ────────────────────────────────────────────────────────────────

impl Recording {
    /// Load a recording written by [`Recording::save`] (or exported by an
    /// acquisition converter in the same layout).
    pub fn load(path: &Path) -> Result<Self> {
        let st = StReader::open(path)?;
        let info: RecordingInfo = st.meta("info")?;
        let data = st.array2("data")?;
        Recording::new(info, data).with_context(|| format!("loading {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = StWriter::new();
        w.add_array("data", &self.data);
        w.add_meta("info", &self.info)?;
        w.write(path)
    }
}
