use std::sync::Arc;

use crate::index::revindex::{DB, STORAGE};
use crate::storage::Storage;
use crate::{Error, Result};

/// Store data in the `storage` column family of a RevIndex
#[derive(Clone)]
pub struct RocksDBStorage {
    db: Arc<DB>,
}

impl RocksDBStorage {
    pub fn from_db(db: Arc<DB>) -> Self {
        Self { db }
    }

    fn cf(&self) -> Result<Arc<::rocksdb::BoundColumnFamily<'_>>> {
        self.db.cf_handle(STORAGE).ok_or_else(|| Error::CorruptIndex {
            path: self.db.path().display().to_string(),
            message: format!("missing column family '{STORAGE}'"),
        })
    }
}

impl Storage for RocksDBStorage {
    fn save(&self, path: &str, content: &[u8]) -> Result<String> {
        let cf_storage = self.cf()?;
        self.db.put_cf(&cf_storage, path.as_bytes(), content)?;
        Ok(path.into())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let cf_storage = self.cf()?;
        let data = self.db.get_cf(&cf_storage, path.as_bytes())?;
        data.ok_or_else(|| Error::DataNotFound { path: path.into() })
    }

    fn spec(&self) -> String {
        "rocksdb://".into()
    }
}
