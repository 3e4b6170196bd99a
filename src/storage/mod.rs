//! Places where signatures live.
//!
//! A closed set of backends sits behind the [`Storage`] trait: plain files,
//! zip archives, process memory and the `storage` column family of a
//! RevIndex. Each backend is described by a spec string so a RevIndex built
//! with external storage can find the original sketches again.

pub mod rocksdb;

use std::collections::HashMap;
use std::fs::{DirBuilder, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path as Path, Utf8PathBuf as PathBuf};
use enum_dispatch::enum_dispatch;
use typed_builder::TypedBuilder;

use crate::signature::Signature;
use crate::{Error, Result};

pub use self::rocksdb::RocksDBStorage;

pub const MANIFEST_NAME: &str = "SOURMASH-MANIFEST.csv";

pub trait ToWriter {
    fn to_writer<W>(&self, writer: &mut W) -> Result<()>
    where
        W: Write;
}

/// An abstraction for any place where we can store data.
#[enum_dispatch]
pub trait Storage {
    /// Save bytes into path
    fn save(&self, path: &str, content: &[u8]) -> Result<String>;

    /// Load bytes from path
    fn load(&self, path: &str) -> Result<Vec<u8>>;

    /// Spec string used to reopen this storage
    fn spec(&self) -> String;

    fn load_sigs(&self, path: &str) -> Result<Vec<Signature>> {
        let raw = self.load(path)?;
        Signature::from_reader(&raw[..])
    }

    fn save_sig(&self, path: &str, sig: &Signature) -> Result<String> {
        let mut buffer = vec![];
        sig.to_writer(&mut buffer)?;
        self.save(path, &buffer)
    }
}

#[enum_dispatch(Storage)]
#[derive(Clone)]
pub enum InnerStorage {
    FS(FSStorage),
    Zip(ZipStorage),
    Mem(MemStorage),
    RocksDB(RocksDBStorage),
}

impl InnerStorage {
    /// Reopen a storage from its spec string.
    ///
    /// `rocksdb://` needs an open database and is resolved by the RevIndex.
    pub fn from_spec(spec: &str) -> Result<Self> {
        if let Some(path) = spec.strip_prefix("fs://") {
            Ok(FSStorage::new(path, "").into())
        } else if let Some(path) = spec.strip_prefix("zip://") {
            Ok(ZipStorage::from_file(path)?.into())
        } else {
            Err(Error::Storage {
                message: format!("cannot open storage from spec '{spec}'"),
            })
        }
    }

    /// Whether sketches can be found again through `spec()` by another process.
    pub fn is_external(&self) -> bool {
        matches!(self, InnerStorage::FS(_) | InnerStorage::Zip(_))
    }
}

/// Store files locally into a directory
#[derive(TypedBuilder, Debug, Clone, Default)]
pub struct FSStorage {
    /// absolute path for the directory where data is saved.
    fullpath: PathBuf,
    subdir: String,
}

impl FSStorage {
    pub fn new(location: &str, subdir: &str) -> FSStorage {
        let mut fullpath = PathBuf::from(location);
        if !subdir.is_empty() {
            fullpath.push(subdir);
        }

        FSStorage {
            fullpath,
            subdir: subdir.into(),
        }
    }

    pub fn fullpath(&self) -> &Path {
        &self.fullpath
    }
}

impl Storage for FSStorage {
    fn save(&self, path: &str, content: &[u8]) -> Result<String> {
        if path.is_empty() {
            return Err(Error::Storage {
                message: "path can't be empty".into(),
            });
        }

        let fpath = self.fullpath.join(path);
        if let Some(parent) = fpath.parent() {
            DirBuilder::new().recursive(true).create(parent)?;
        }

        let file = File::create(&fpath)?;
        let mut buf_writer = BufWriter::new(file);
        buf_writer.write_all(content)?;
        Ok(path.into())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.fullpath.join(path);
        let file = File::open(&path).map_err(|_| Error::DataNotFound {
            path: path.to_string(),
        })?;
        let mut buf_reader = BufReader::new(file);
        let mut contents = Vec::new();
        buf_reader.read_to_end(&mut contents)?;
        Ok(contents)
    }

    fn spec(&self) -> String {
        format!("fs://{}", self.fullpath)
    }
}

/// Read-only access to a zip archive of signatures.
#[derive(Clone)]
pub struct ZipStorage {
    path: PathBuf,
    mapping: Arc<memmap2::Mmap>,
}

fn zip_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::LoadFailure {
        path: path.to_string(),
        message: e.to_string(),
    }
}

impl ZipStorage {
    pub fn from_file<P: AsRef<Path>>(location: P) -> Result<Self> {
        let path = location.as_ref().to_path_buf();
        let zip_file = File::open(&path)?;
        let mapping = unsafe { memmap2::Mmap::map(&zip_file)? };

        // fail early on anything that isn't a zip archive
        piz::ZipArchive::new(&mapping).map_err(|e| zip_error(&path, e))?;

        Ok(Self {
            path,
            mapping: Arc::new(mapping),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Paths of all entries in the archive.
    pub fn filenames(&self) -> Result<Vec<String>> {
        let archive = piz::ZipArchive::new(&self.mapping).map_err(|e| zip_error(&self.path, e))?;
        Ok(archive
            .entries()
            .iter()
            .map(|entry| entry.path.as_str().to_string())
            .collect())
    }

    pub fn has_manifest(&self) -> Result<bool> {
        Ok(self.filenames()?.iter().any(|f| f == MANIFEST_NAME))
    }
}

impl Storage for ZipStorage {
    fn save(&self, _path: &str, _content: &[u8]) -> Result<String> {
        Err(Error::Storage {
            message: format!("zip archive '{}' is read-only", self.path),
        })
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        use piz::read::FileTree;

        let archive = piz::ZipArchive::new(&self.mapping).map_err(|e| zip_error(&self.path, e))?;
        let tree = piz::read::as_tree(archive.entries()).map_err(|e| zip_error(&self.path, e))?;
        let entry = tree.lookup(path).map_err(|_| Error::DataNotFound {
            path: format!("{}/{}", self.path, path),
        })?;

        let mut reader =
            BufReader::new(archive.read(entry).map_err(|e| zip_error(&self.path, e))?);
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents)?;

        Ok(contents)
    }

    fn spec(&self) -> String {
        format!("zip://{}", self.path)
    }
}

#[derive(Clone, Default)]
pub struct MemStorage {
    sigs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn save(&self, path: &str, content: &[u8]) -> Result<String> {
        let mut lock = self.sigs.write().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        lock.insert(path.into(), content.into());
        Ok(path.into())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let lock = self.sigs.read().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        lock.get(path).cloned().ok_or_else(|| Error::DataNotFound {
            path: path.into(),
        })
    }

    fn spec(&self) -> String {
        "memory://".into()
    }
}
