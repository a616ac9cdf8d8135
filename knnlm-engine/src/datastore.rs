//! Fixed-capacity on-disk kNN-LM datastore.
//!
//! Three files share a prefix:
//! ```text
//! <prefix>_keys.npy  capacity × dim keys, raw little-endian f16 or f32
//! <prefix>_vals.npy  capacity × 1 token ids, raw little-endian i64
//! <prefix>_map.json  {"<sample id>": [start, end], ...}
//! ```
//! The arrays carry no header (numpy `memmap` layout); their shape is fixed
//! when the writer is created. Rows are appended behind a cursor that never
//! passes the capacity.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EvalError, Result};
use crate::tensor::{Matrix, TokenId};

const VALUE_BYTES: usize = std::mem::size_of::<i64>();

/// Storage type of datastore keys.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPrecision {
    Fp16,
    #[default]
    Fp32,
}

impl KeyPrecision {
    pub fn bytes(self) -> usize {
        match self {
            KeyPrecision::Fp16 => 2,
            KeyPrecision::Fp32 => 4,
        }
    }
}

/// Sample id → half-open `[start, end)` row range.
pub type SampleRanges = BTreeMap<u64, (u64, u64)>;

/// File locations for a datastore prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastorePaths {
    pub keys: PathBuf,
    pub vals: PathBuf,
    pub map: PathBuf,
}

impl DatastorePaths {
    pub fn from_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = OsString::from(prefix.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            keys: with_suffix("_keys.npy"),
            vals: with_suffix("_vals.npy"),
            map: with_suffix("_map.json"),
        }
    }
}

/// Result of one [`DatastoreWriter::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// First row written.
    pub start: usize,
    /// Rows actually written.
    pub written: usize,
    /// Some rows were dropped because the datastore is full.
    pub truncated: bool,
}

/// Final state of a datastore after [`DatastoreWriter::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreSummary {
    pub rows: usize,
    pub capacity: usize,
    pub dim: usize,
    pub precision: KeyPrecision,
    pub samples: usize,
    pub overflowed: bool,
    pub paths: DatastorePaths,
}

/// Single writer appending keys and values into memory-mapped arrays.
pub struct DatastoreWriter {
    paths: DatastorePaths,
    keys: MmapMut,
    vals: MmapMut,
    capacity: usize,
    dim: usize,
    precision: KeyPrecision,
    cursor: usize,
    ranges: SampleRanges,
    overflowed: bool,
}

impl DatastoreWriter {
    /// Create (or overwrite) the datastore files under `prefix` with a fixed shape.
    pub fn create(
        prefix: &Path,
        capacity: usize,
        dim: usize,
        precision: KeyPrecision,
    ) -> Result<Self> {
        if capacity == 0 || dim == 0 {
            return Err(EvalError::InvalidConfiguration(format!(
                "datastore shape must be positive, got {}x{}",
                capacity, dim
            )));
        }
        let paths = DatastorePaths::from_prefix(prefix);
        if let Some(parent) = paths.keys.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let keys = map_new_file(&paths.keys, capacity * dim * precision.bytes())?;
        let vals = map_new_file(&paths.vals, capacity * VALUE_BYTES)?;
        info!(
            "Datastore {:?}: {} x {} keys ({:?})",
            prefix, capacity, dim, precision
        );

        Ok(Self {
            paths,
            keys,
            vals,
            capacity,
            dim,
            precision,
            cursor: 0,
            ranges: SampleRanges::new(),
            overflowed: false,
        })
    }

    /// Append the keys and target values of one sequence.
    ///
    /// When the rows do not fit, only the leading rows that do are written and
    /// the outcome is flagged as truncated. The recorded range always covers
    /// exactly the rows written.
    pub fn write(
        &mut self,
        sample_id: u64,
        keys: &Matrix<f32>,
        values: &[TokenId],
    ) -> Result<WriteOutcome> {
        if keys.rows() != values.len() {
            return Err(EvalError::Shape(format!(
                "{} keys for {} values",
                keys.rows(),
                values.len()
            )));
        }
        if !values.is_empty() && keys.cols() != self.dim {
            return Err(EvalError::Shape(format!(
                "key width {} does not match datastore dimension {}",
                keys.cols(),
                self.dim
            )));
        }

        let start = self.cursor;
        let written = values.len().min(self.capacity - start);
        let truncated = written < values.len();
        if truncated {
            if self.overflowed {
                debug!(
                    "Datastore full, dropped {} rows of sample {}",
                    values.len() - written,
                    sample_id
                );
            } else {
                warn!(
                    "Datastore capacity {} exceeded at sample {}: writing {} of {} rows",
                    self.capacity,
                    sample_id,
                    written,
                    values.len()
                );
            }
            self.overflowed = true;
        }

        let width = self.precision.bytes();
        for (r, &value) in values.iter().take(written).enumerate() {
            let row = start + r;
            let key_base = row * self.dim * width;
            let dst = &mut self.keys[key_base..key_base + self.dim * width];
            match self.precision {
                KeyPrecision::Fp16 => {
                    for (cell, &x) in dst.chunks_exact_mut(2).zip(keys.row(r)) {
                        cell.copy_from_slice(&half::f16::from_f32(x).to_le_bytes());
                    }
                }
                KeyPrecision::Fp32 => {
                    for (cell, &x) in dst.chunks_exact_mut(4).zip(keys.row(r)) {
                        cell.copy_from_slice(&x.to_le_bytes());
                    }
                }
            }
            let val_base = row * VALUE_BYTES;
            self.vals[val_base..val_base + VALUE_BYTES]
                .copy_from_slice(&i64::from(value).to_le_bytes());
        }

        self.cursor += written;
        self.ranges
            .insert(sample_id, (start as u64, self.cursor as u64));
        Ok(WriteOutcome {
            start,
            written,
            truncated,
        })
    }

    /// Rows written so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn precision(&self) -> KeyPrecision {
        self.precision
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.capacity
    }

    /// Whether any write has been truncated.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn sample_ranges(&self) -> &SampleRanges {
        &self.ranges
    }

    pub fn paths(&self) -> &DatastorePaths {
        &self.paths
    }

    /// Flush both arrays and persist the sample range map.
    pub fn finish(self) -> Result<DatastoreSummary> {
        self.keys.flush()?;
        self.vals.flush()?;
        save_sample_ranges(&self.paths.map, &self.ranges)?;

        info!(
            "Datastore rows used: {} of {} ({} samples{})",
            self.cursor,
            self.capacity,
            self.ranges.len(),
            if self.overflowed { ", truncated" } else { "" }
        );
        Ok(DatastoreSummary {
            rows: self.cursor,
            capacity: self.capacity,
            dim: self.dim,
            precision: self.precision,
            samples: self.ranges.len(),
            overflowed: self.overflowed,
            paths: self.paths,
        })
    }
}

fn map_new_file(path: &Path, len: usize) -> Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len as u64)?;
    // SAFETY: the file was just created by this process and is only accessed
    // through this mapping until the writer is dropped.
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(map)
}

/// Write the sample range map as JSON.
pub fn save_sample_ranges(path: &Path, ranges: &SampleRanges) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, ranges)?;
    writer.flush()?;
    Ok(())
}

/// Read a sample range map written by [`save_sample_ranges`].
pub fn load_sample_ranges(path: &Path) -> Result<SampleRanges> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Read-only view of a saved datastore.
pub struct Datastore {
    keys: Mmap,
    vals: Mmap,
    rows: usize,
    capacity: usize,
    dim: usize,
    precision: KeyPrecision,
    ranges: Option<SampleRanges>,
}

impl Datastore {
    /// Open the datastore under `prefix`.
    ///
    /// The capacity is derived from the value file. When the range map exists
    /// only the rows it covers are considered in use.
    pub fn open(prefix: &Path, dim: usize, precision: KeyPrecision) -> Result<Self> {
        if dim == 0 {
            return Err(EvalError::InvalidConfiguration(
                "datastore dimension must be positive".to_string(),
            ));
        }
        let paths = DatastorePaths::from_prefix(prefix);
        let vals = map_existing(&paths.vals)?;
        let keys = map_existing(&paths.keys)?;

        if vals.len() % VALUE_BYTES != 0 {
            return Err(EvalError::Datastore(format!(
                "{:?} is not a whole number of i64 values",
                paths.vals
            )));
        }
        let capacity = vals.len() / VALUE_BYTES;
        let expected = capacity * dim * precision.bytes();
        if keys.len() != expected {
            return Err(EvalError::Datastore(format!(
                "{:?} has {} bytes, expected {} for {} x {} {:?} keys",
                paths.keys,
                keys.len(),
                expected,
                capacity,
                dim,
                precision
            )));
        }

        let ranges = if paths.map.exists() {
            Some(load_sample_ranges(&paths.map)?)
        } else {
            None
        };
        let rows = match &ranges {
            Some(r) => r.values().map(|&(_, end)| end as usize).max().unwrap_or(0),
            None => capacity,
        };
        if rows > capacity {
            return Err(EvalError::Datastore(format!(
                "range map covers {} rows but capacity is {}",
                rows, capacity
            )));
        }
        debug!("Opened datastore {:?}: {} of {} rows", prefix, rows, capacity);

        Ok(Self {
            keys,
            vals,
            rows,
            capacity,
            dim,
            precision,
            ranges,
        })
    }

    /// Rows in use.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn precision(&self) -> KeyPrecision {
        self.precision
    }

    pub fn sample_ranges(&self) -> Option<&SampleRanges> {
        self.ranges.as_ref()
    }

    /// Decode key row `index` into `out` (length `dim`).
    pub fn key_into(&self, index: usize, out: &mut [f32]) {
        let width = self.precision.bytes();
        let base = index * self.dim * width;
        let src = &self.keys[base..base + self.dim * width];
        match self.precision {
            KeyPrecision::Fp16 => {
                for (x, b) in out.iter_mut().zip(src.chunks_exact(2)) {
                    *x = half::f16::from_le_bytes([b[0], b[1]]).to_f32();
                }
            }
            KeyPrecision::Fp32 => {
                for (x, b) in out.iter_mut().zip(src.chunks_exact(4)) {
                    *x = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                }
            }
        }
    }

    pub fn key(&self, index: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.dim];
        self.key_into(index, &mut out);
        out
    }

    pub fn value(&self, index: usize) -> i64 {
        let base = index * VALUE_BYTES;
        let mut buf = [0u8; VALUE_BYTES];
        buf.copy_from_slice(&self.vals[base..base + VALUE_BYTES]);
        i64::from_le_bytes(buf)
    }
}

fn map_existing(path: &Path) -> Result<Mmap> {
    let file = File::open(path)
        .map_err(|e| EvalError::Datastore(format!("cannot open {:?}: {}", path, e)))?;
    // SAFETY: datastore files are not modified while a reader holds them.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}
