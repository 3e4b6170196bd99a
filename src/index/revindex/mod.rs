//! On-disk reverse index over RocksDB.
//!
//! Three column families make up an index:
//!
//! - `hashes`: hash (u64, little endian) -> [`Datasets`] holding it.
//!   Values are unioned by a merge operator, so many threads can insert
//!   concurrently during a build.
//! - `metadata`: format version, manifest and storage spec.
//! - `storage`: sketches embedded in the index (internal storage).

pub mod disk_revindex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use rocksdb::{ColumnFamilyDescriptor, MergeOperands, Options};
use roaring::RoaringBitmap;
use stats::{MinMax, OnlineStats};

use crate::encodings::Idx;
use crate::{Error, Result};

pub use disk_revindex::{GatherCounters, RevIndex};

pub type DB = rocksdb::DBWithThreadMode<rocksdb::MultiThreaded>;

pub const HASHES: &str = "hashes";
pub const METADATA: &str = "metadata";
pub const STORAGE: &str = "storage";

pub const VERSION: &str = "version";
pub const MANIFEST: &str = "manifest";
pub const STORAGE_SPEC: &str = "storage_spec";

/// Current on-disk format.
pub const DB_VERSION: u8 = 1;

/// Set of dataset ids holding one hash.
#[derive(Debug, Default, PartialEq, Clone)]
pub enum Datasets {
    #[default]
    Empty,
    Unique(Idx),
    Many(RoaringBitmap),
}

impl IntoIterator for Datasets {
    type Item = Idx;
    type IntoIter = Box<dyn Iterator<Item = Self::Item>>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Self::Empty => Box::new(std::iter::empty()),
            Self::Unique(v) => Box::new(std::iter::once(v)),
            Self::Many(v) => Box::new(v.into_iter()),
        }
    }
}

impl Datasets {
    pub fn new(vals: &[Idx]) -> Self {
        match vals {
            [] => Self::Empty,
            [v] => Self::Unique(*v),
            vals => Self::Many(vals.iter().copied().collect()),
        }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        match slice.len() {
            1 => Some(Self::Empty),
            8 => (&slice[..])
                .read_u64::<LittleEndian>()
                .ok()
                .and_then(|v| Idx::try_from(v).ok())
                .map(Self::Unique),
            _ => RoaringBitmap::deserialize_from(slice).ok().map(Self::Many),
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Empty => Ok(vec![42_u8]),
            Self::Unique(v) => {
                let mut buf = Vec::with_capacity(8);
                buf.write_u64::<LittleEndian>(u64::from(*v))?;
                Ok(buf)
            }
            Self::Many(v) => {
                let mut buf = Vec::with_capacity(v.serialized_size());
                v.serialize_into(&mut buf)?;
                Ok(buf)
            }
        }
    }

    pub fn union(&mut self, other: Datasets) {
        match self {
            Datasets::Empty => *self = other,
            Datasets::Unique(v) => match other {
                Datasets::Empty => (),
                Datasets::Unique(o) => {
                    if *v != o {
                        *self = Datasets::Many([*v, o].iter().copied().collect())
                    }
                }
                Datasets::Many(mut o) => {
                    o.insert(*v);
                    *self = Datasets::Many(o);
                }
            },
            Datasets::Many(ref mut v) => v.extend(other),
        }
    }

    pub fn contains(&self, value: Idx) -> bool {
        match self {
            Self::Empty => false,
            Self::Unique(v) => *v == value,
            Self::Many(ref v) => v.contains(value),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Unique(_) => 1,
            Self::Many(ref v) => v.len() as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest dataset id in the set.
    pub fn max(&self) -> Option<Idx> {
        match self {
            Self::Empty => None,
            Self::Unique(v) => Some(*v),
            Self::Many(ref v) => v.max(),
        }
    }
}

fn merge_datasets(
    _: &[u8],
    existing_val: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut datasets = match existing_val {
        Some(raw) => Datasets::from_slice(raw)?,
        None => Datasets::default(),
    };

    for op in operands {
        datasets.union(Datasets::from_slice(op)?);
    }
    datasets.as_bytes().ok()
}

pub(crate) fn db_options() -> Options {
    let mut opts = Options::default();
    opts.set_max_open_files(500);

    // Updated defaults from
    // https://github.com/facebook/rocksdb/wiki/Setup-Options-and-Basic-Tuning#other-general-options
    opts.set_bytes_per_sync(1048576);
    let mut block_opts = rocksdb::BlockBasedOptions::default();
    block_opts.set_block_size(16 * 1024);
    block_opts.set_cache_index_and_filter_blocks(true);
    block_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);
    block_opts.set_format_version(5);
    opts.set_block_based_table_factory(&block_opts);
    // End of updated defaults

    opts.increase_parallelism(8);

    opts
}

fn cf_options(name: &str) -> Options {
    let mut cfopts = Options::default();
    cfopts.set_max_write_buffer_number(16);
    // Updated default
    cfopts.set_level_compaction_dynamic_level_bytes(true);

    if name == HASHES {
        cfopts.set_merge_operator_associative("datasets operator", merge_datasets);
        cfopts.set_min_write_buffer_number_to_merge(10);
    }
    cfopts
}

pub(crate) fn cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    [HASHES, METADATA, STORAGE]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, cf_options(name)))
        .collect()
}

/// Descriptors for column families already present on disk.
///
/// Unknown families are opened with default options.
pub(crate) fn existing_cf_descriptors(names: &[String]) -> Vec<ColumnFamilyDescriptor> {
    names
        .iter()
        .filter(|name| name.as_str() != rocksdb::DEFAULT_COLUMN_FAMILY_NAME)
        .map(|name| ColumnFamilyDescriptor::new(name, cf_options(name)))
        .collect()
}

/// Summary of the `hashes` column family, as reported by `check`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DbStats {
    /// records in the manifest
    pub total_datasets: usize,
    /// distinct hashes stored
    pub total_keys: usize,
    /// bytes used by keys
    pub kcount: usize,
    /// bytes used by values
    pub vcount: usize,
    /// largest number of datasets sharing one hash (full check only)
    pub max_datasets_per_hash: usize,
    /// mean number of datasets per hash (full check only)
    pub mean_datasets_per_hash: f64,
    /// standard deviation of datasets per hash (full check only)
    pub stddev_datasets_per_hash: f64,
}

/// Walk the `hashes` column family.
///
/// Keys are always counted; values are decoded only when `quick` is false,
/// and every dataset id found must be below `total_datasets`.
pub(crate) fn stats_for_hashes(
    db: &DB,
    path: &str,
    total_datasets: usize,
    quick: bool,
) -> Result<DbStats> {
    let cf = db.cf_handle(HASHES).ok_or_else(|| Error::CorruptIndex {
        path: path.into(),
        message: format!("missing column family '{HASHES}'"),
    })?;

    let corrupt = |message: String| Error::CorruptIndex {
        path: path.into(),
        message,
    };

    let mut stats = DbStats {
        total_datasets,
        ..Default::default()
    };
    let mut vcounts = OnlineStats::new();
    let mut vmax = MinMax::new();

    for result in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
        let (key, value) = result?;
        if key.len() != 8 {
            return Err(corrupt(format!("hash key with {} bytes", key.len())));
        }
        stats.total_keys += 1;
        stats.kcount += key.len();
        stats.vcount += value.len();

        if !quick {
            let datasets = Datasets::from_slice(&value)
                .ok_or_else(|| corrupt("undecodable dataset set".into()))?;
            if let Some(max_id) = datasets.max() {
                if max_id as usize >= total_datasets {
                    return Err(corrupt(format!(
                        "dataset id {max_id} not in manifest ({total_datasets} records)"
                    )));
                }
            }
            vcounts.add(datasets.len());
            vmax.add(datasets.len());
        }
    }

    if !quick && stats.total_keys > 0 {
        stats.max_datasets_per_hash = vmax.max().copied().unwrap_or(0);
        stats.mean_datasets_per_hash = vcounts.mean();
        stats.stddev_datasets_per_hash = vcounts.stddev();
    }

    info!("*** {} ***", HASHES);
    info!("total datasets: {}", stats.total_datasets);
    info!("total keys: {}", stats.total_keys);
    info!("k: {} bytes", stats.kcount);
    info!("v: {} bytes", stats.vcount);
    if !quick && stats.total_keys > 0 {
        info!("max v: {}", stats.max_datasets_per_hash);
        info!("mean v: {:.3}", stats.mean_datasets_per_hash);
        info!("stddev: {:.3}", stats.stddev_datasets_per_hash);
    }

    Ok(stats)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn datasets_encoding() {
        let empty = Datasets::new(&[]);
        assert_eq!(empty.as_bytes().unwrap(), vec![42]);
        assert_eq!(Datasets::from_slice(&[42]), Some(Datasets::Empty));

        let unique = Datasets::new(&[7]);
        let raw = unique.as_bytes().unwrap();
        assert_eq!(raw, [7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Datasets::from_slice(&raw), Some(unique));

        let many = Datasets::new(&[1, 5, 9]);
        let raw = many.as_bytes().unwrap();
        let back = Datasets::from_slice(&raw).unwrap();
        assert_eq!(back.into_iter().collect::<Vec<_>>(), vec![1, 5, 9]);
    }

    #[test]
    fn unique_id_out_of_range() {
        let raw = u64::MAX.to_le_bytes();
        assert_eq!(Datasets::from_slice(&raw), None);
    }

    #[test]
    fn datasets_union() {
        let mut ds = Datasets::default();
        ds.union(Datasets::Unique(2));
        assert_eq!(ds, Datasets::Unique(2));

        ds.union(Datasets::Unique(2));
        assert_eq!(ds, Datasets::Unique(2));

        ds.union(Datasets::Unique(4));
        assert_eq!(ds.len(), 2);
        assert!(ds.contains(2));
        assert!(ds.contains(4));
        assert!(!ds.contains(3));

        ds.union(Datasets::new(&[4, 10]));
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.max(), Some(10));

        let mut single = Datasets::Unique(1);
        single.union(Datasets::new(&[2, 3]));
        assert_eq!(single.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
