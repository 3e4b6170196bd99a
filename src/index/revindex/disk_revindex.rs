use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use camino::Utf8Path as Path;
use log::{debug, info, trace, warn};
use nohash_hasher::BuildNoHashHasher;
use rayon::prelude::*;
use rocksdb::BoundColumnFamily;

use crate::collection::{Collection, CollectionSet, SmallSignature};
use crate::encodings::Idx;
use crate::gather::{CandidateKey, GatherResult, RankOverlap};
use crate::index::revindex::{
    cf_descriptors, db_options, existing_cf_descriptors, stats_for_hashes, Datasets, DbStats, DB,
    DB_VERSION, HASHES, MANIFEST, METADATA, STORAGE, STORAGE_SPEC, VERSION,
};
use crate::index::SigCounter;
use crate::manifest::{Manifest, Record};
use crate::selection::Selection;
use crate::sketch::minhash::KmerMinHash;
use crate::storage::{InnerStorage, RocksDBStorage, Storage};
use crate::{Error, HashIntoType, Result};

type HashToDatasets = HashMap<HashIntoType, Datasets, BuildNoHashHasher<HashIntoType>>;

/// Per-query state for a RevIndex gather.
///
/// `counter` holds, for every dataset, how many query hashes it shares;
/// `hash_to_datasets` maps each query hash present in the index to the
/// datasets holding it.
#[derive(Debug, Clone, Default)]
pub struct GatherCounters {
    pub counter: SigCounter,
    hash_to_datasets: HashToDatasets,
}

impl GatherCounters {
    /// Query hashes found in the index.
    pub fn len(&self) -> usize {
        self.hash_to_datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hash_to_datasets.is_empty()
    }
}

/// Inverted index from hashes to datasets, stored in RocksDB.
///
/// Handles are cheap to clone and share one open database.
#[derive(Clone)]
pub struct RevIndex {
    db: Arc<DB>,
    collection: Arc<CollectionSet>,
    path: String,
}

fn cf<'a>(db: &'a DB, path: &str, name: &str) -> Result<Arc<BoundColumnFamily<'a>>> {
    db.cf_handle(name).ok_or_else(|| Error::CorruptIndex {
        path: path.into(),
        message: format!("missing column family '{name}'"),
    })
}

fn list_cfs(path: &Path) -> Result<Vec<String>> {
    let names = DB::list_cf(&db_options(), path).map_err(|_| Error::NotRevIndex {
        path: path.to_string(),
    })?;
    if [HASHES, METADATA]
        .iter()
        .any(|required| !names.iter().any(|n| n == required))
    {
        return Err(Error::NotRevIndex {
            path: path.to_string(),
        });
    }
    Ok(names)
}

fn check_version(db: &DB, path: &str) -> Result<()> {
    let cf_metadata = cf(db, path, METADATA)?;
    match db.get_cf(&cf_metadata, VERSION)?.as_deref() {
        None | Some([]) => Err(Error::OldRevIndexFormat {
            path: path.into(),
            missing: "format version stamp".into(),
        }),
        Some([version, ..]) if *version < DB_VERSION => Err(Error::OldRevIndexFormat {
            path: path.into(),
            missing: format!("format version {DB_VERSION} (found {version})"),
        }),
        Some([version, ..]) if *version > DB_VERSION => Err(Error::CorruptIndex {
            path: path.into(),
            message: format!("unsupported format version {version}"),
        }),
        Some(_) => Ok(()),
    }
}

impl RevIndex {
    /// Build a new index at `path` from `collection`.
    ///
    /// Everything that can be checked up front is checked before the
    /// database is created. The format version is written last, so an
    /// interrupted build is never mistaken for a usable index.
    ///
    /// Hashes are inserted on the current rayon pool; run inside
    /// [`Scheduler::install`](crate::scheduler::Scheduler::install) to bound it.
    pub fn create<P: AsRef<Path>>(
        path: P,
        collection: CollectionSet,
        use_internal_storage: bool,
    ) -> Result<Self> {
        let path = path.as_ref();

        if collection.is_empty() {
            return Err(Error::EmptyCollection {
                path: path.to_string(),
            });
        }
        if !use_internal_storage && !collection.storage().is_external() {
            return Err(Error::ExternalStorageUnavailable {
                message: format!(
                    "sketches in '{}' have no stable path; use internal storage",
                    collection.storage().spec()
                ),
            });
        }
        if path.exists() && (path.is_file() || path.read_dir()?.next().is_some()) {
            return Err(Error::IndexExists {
                path: path.to_string(),
            });
        }

        let mut opts = db_options();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.prepare_for_bulk_load();

        let db = Arc::new(DB::open_cf_descriptors(&opts, path, cf_descriptors())?);
        let internal = if use_internal_storage {
            Some(RocksDBStorage::from_db(db.clone()))
        } else {
            None
        };

        info!("Indexing {} sketches.", collection.len());
        let processed_sigs = AtomicUsize::new(0);
        let records = collection
            .par_iter()
            .map(|(dataset_id, record)| {
                let i = processed_sigs.fetch_add(1, Ordering::SeqCst);
                if i % 1000 == 0 {
                    info!("Processed {} reference sigs", i);
                }
                Self::map_hashes(
                    &db,
                    path.as_str(),
                    &collection,
                    dataset_id,
                    record,
                    internal.as_ref(),
                )
            })
            .collect::<Result<Vec<Record>>>()?;

        let storage: InnerStorage = match internal {
            Some(storage) => storage.into(),
            None => collection.storage().clone(),
        };
        let collection: CollectionSet =
            Collection::new(Manifest::from(records), storage).try_into()?;

        let index = Self {
            db,
            collection: Arc::new(collection),
            path: path.to_string(),
        };
        index.save_collection()?;
        index.flush()?;

        info!("Compact SSTs");
        index.compact()?;

        index.stamp_version()?;
        index.flush()?;
        info!("Processed {} reference sigs", processed_sigs.into_inner());

        Ok(index)
    }

    /// Insert the hashes of one dataset and return its record in the index
    /// manifest.
    fn map_hashes(
        db: &DB,
        path: &str,
        collection: &CollectionSet,
        dataset_id: Idx,
        record: &Record,
        internal: Option<&RocksDBStorage>,
    ) -> Result<Record> {
        let sig = collection.sig_for_dataset(dataset_id)?;
        let mh = sig.minhash().ok_or_else(|| Error::DataNotFound {
            path: record.internal_location().to_string(),
        })?;

        let datasets = Datasets::new(&[dataset_id]).as_bytes()?;
        let cf_hashes = cf(db, path, HASHES)?;

        let mut batch = rocksdb::WriteBatch::default();
        for hash in mh.iter_mins() {
            batch.merge_cf(&cf_hashes, hash.to_le_bytes(), datasets.as_slice());
        }
        db.write(batch)?;

        match internal {
            Some(storage) => {
                let location = format!("signatures/{}-{}.sig", dataset_id, mh.md5sum());
                storage.save_sig(&location, &sig)?;
                Record::from_sig(&sig, &location)
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::DataNotFound { path: location })
            }
            None => {
                let mut record = record.clone();
                record.set_scaled(mh.scaled());
                record.set_n_hashes(mh.size());
                Ok(record)
            }
        }
    }

    /// Open an existing index.
    ///
    /// Old-format databases are refused; see [`RevIndex::upgrade`].
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let names = list_cfs(path)?;
        if !names.iter().any(|n| n == STORAGE) {
            return Err(Error::OldRevIndexFormat {
                path: path.to_string(),
                missing: format!("column family '{STORAGE}'"),
            });
        }

        let opts = db_options();
        let cfs = existing_cf_descriptors(&names);
        let db = if read_only {
            Arc::new(DB::open_cf_descriptors_read_only(&opts, path, cfs, false)?)
        } else {
            Arc::new(DB::open_cf_descriptors(&opts, path, cfs)?)
        };

        check_version(&db, path.as_str())?;
        let collection = Arc::new(Self::load_collection_from_rocksdb(db.clone(), path.as_str())?);
        debug!(
            "opened RevIndex '{}' with {} datasets",
            path,
            collection.len()
        );

        Ok(Self {
            db,
            collection,
            path: path.to_string(),
        })
    }

    fn load_collection_from_rocksdb(db: Arc<DB>, path: &str) -> Result<CollectionSet> {
        let cf_metadata = cf(&db, path, METADATA)?;
        let missing = |what: &str| Error::CorruptIndex {
            path: path.into(),
            message: format!("missing {what}"),
        };

        let rdr = db
            .get_cf(&cf_metadata, MANIFEST)?
            .ok_or_else(|| missing("manifest"))?;
        let manifest = Manifest::from_reader(&rdr[..])?;

        let raw_spec = db
            .get_cf(&cf_metadata, STORAGE_SPEC)?
            .ok_or_else(|| missing("storage spec"))?;
        let spec = std::str::from_utf8(&raw_spec)?;

        let storage = if spec == "rocksdb://" {
            RocksDBStorage::from_db(db.clone()).into()
        } else {
            InnerStorage::from_spec(spec)?
        };

        Collection::new(manifest, storage).try_into()
    }

    fn save_collection(&self) -> Result<()> {
        let cf_metadata = self.cf(METADATA)?;

        let mut wtr = vec![];
        self.collection.manifest().to_writer(&mut wtr)?;
        self.db.put_cf(&cf_metadata, MANIFEST, &wtr[..])?;

        let spec = self.collection.storage().spec();
        self.db.put_cf(&cf_metadata, STORAGE_SPEC, spec)?;

        Ok(())
    }

    fn stamp_version(&self) -> Result<()> {
        let cf_metadata = self.cf(METADATA)?;
        self.db.put_cf(&cf_metadata, VERSION, [DB_VERSION])?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        cf(&self.db, &self.path, name)
    }

    fn compact(&self) -> Result<()> {
        for cf_name in [HASHES, METADATA, STORAGE] {
            let cf = self.cf(cf_name)?;
            self.db.compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>)
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush_wal(true)?;

        for cf_name in [HASHES, METADATA, STORAGE] {
            let cf = self.cf(cf_name)?;
            self.db.flush_cf(&cf)?;
        }

        Ok(())
    }

    /// Validate the index at `path`.
    ///
    /// Quick mode checks the structure (column families, version, manifest,
    /// storage spec) and counts keys. Full mode also loads every sketch
    /// named in the manifest and decodes every hash entry.
    pub fn check<P: AsRef<Path>>(path: P, quick: bool) -> Result<DbStats> {
        let path = path.as_ref();
        let index = Self::open(path, true)?;

        if !quick {
            let n_failed = index
                .collection
                .par_iter()
                .filter(|(dataset_id, record)| {
                    match index.collection.sig_for_dataset(*dataset_id) {
                        Ok(_) => false,
                        Err(e) => {
                            warn!(
                                "cannot load '{}' from storage: {}",
                                record.internal_location(),
                                e
                            );
                            true
                        }
                    }
                })
                .count();
            if n_failed > 0 {
                return Err(Error::CorruptIndex {
                    path: path.to_string(),
                    message: format!(
                        "{} of {} sketches cannot be loaded from '{}'",
                        n_failed,
                        index.collection.len(),
                        index.collection.storage().spec()
                    ),
                });
            }
        }

        stats_for_hashes(&index.db, path.as_str(), index.collection.len(), quick)
    }

    /// Bring an old-format index at `path` to the current format.
    ///
    /// Missing column families are created and the version is stamped.
    /// Indices already in the current format are left untouched.
    pub fn upgrade<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let names = list_cfs(path)?;

        let mut opts = db_options();
        opts.create_missing_column_families(true);

        let mut cfs = cf_descriptors();
        let extra: Vec<String> = names
            .into_iter()
            .filter(|n| ![HASHES, METADATA, STORAGE].contains(&n.as_str()))
            .collect();
        cfs.extend(existing_cf_descriptors(&extra));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        match check_version(&db, path.as_str()) {
            Ok(()) => {
                info!("'{}' is already at format version {}", path, DB_VERSION);
                return Ok(());
            }
            Err(Error::OldRevIndexFormat { missing, .. }) => {
                info!("upgrading '{}' (missing {})", path, missing);
            }
            Err(e) => return Err(e),
        }

        {
            let cf_metadata = cf(&db, path.as_str(), METADATA)?;
            for key in [MANIFEST, STORAGE_SPEC] {
                if db.get_cf(&cf_metadata, key)?.is_none() {
                    return Err(Error::CorruptIndex {
                        path: path.to_string(),
                        message: format!("missing {key}, cannot upgrade"),
                    });
                }
            }
            db.put_cf(&cf_metadata, VERSION, [DB_VERSION])?;
        }
        db.flush_wal(true)?;
        for cf_name in [HASHES, METADATA, STORAGE] {
            db.flush_cf(&cf(&db, path.as_str(), cf_name)?)?;
        }

        info!("upgraded '{}' to format version {}", path, DB_VERSION);
        Ok(())
    }

    pub fn collection(&self) -> &CollectionSet {
        &self.collection
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }

    /// Selection describing the sketches in this index.
    pub fn selection(&self) -> Result<Selection> {
        self.collection.selection()
    }

    /// Bring `query` to the ksize, moltype and scaled of this index.
    ///
    /// Queries with a coarser scaled than the index cannot be compared.
    pub fn prepare_query(&self, query: &KmerMinHash) -> Result<KmerMinHash> {
        let selection = self.selection()?;
        if let Some(ksize) = selection.ksize() {
            if query.ksize() != ksize {
                return Err(Error::MismatchKSizes);
            }
        }
        if let Some(moltype) = selection.moltype() {
            if query.hash_function() != moltype {
                return Err(Error::MismatchDNAProt);
            }
        }
        match selection.scaled() {
            Some(scaled) if query.scaled() < scaled => query.downsample_scaled(scaled),
            Some(scaled) if query.scaled() > scaled => Err(Error::MismatchScaled),
            _ => Ok(query.clone()),
        }
    }

    /// Datasets for every query hash present in the index.
    fn lookup(&self, query: &KmerMinHash) -> Result<Vec<(HashIntoType, Datasets)>> {
        let cf_hashes = self.cf(HASHES)?;
        let keys: Vec<[u8; 8]> = query.iter_mins().map(|hash| hash.to_le_bytes()).collect();

        let values = self.db.multi_get_cf(keys.iter().map(|k| (&cf_hashes, k)));

        let mut found = Vec::with_capacity(values.len());
        for (hash, raw) in query.iter_mins().zip(values) {
            if let Some(raw) = raw? {
                let datasets =
                    Datasets::from_slice(&raw).ok_or_else(|| Error::CorruptIndex {
                        path: self.path.clone(),
                        message: format!("undecodable datasets for hash {hash}"),
                    })?;
                found.push((*hash, datasets));
            }
        }
        Ok(found)
    }

    /// Count, for every dataset, the query hashes it contains.
    ///
    /// `query` must already be prepared with [`RevIndex::prepare_query`].
    pub fn counter_for_query(&self, query: &KmerMinHash) -> Result<SigCounter> {
        trace!("collecting hashes for query with {} hashes", query.size());
        let mut counter = SigCounter::new();
        for (_, datasets) in self.lookup(query)? {
            counter.update(datasets);
        }
        Ok(counter)
    }

    /// Datasets sharing at least `threshold` hashes with the query, most
    /// shared first (ties by dataset order).
    pub fn matches_from_counter(
        &self,
        counter: &SigCounter,
        threshold: usize,
    ) -> Result<Vec<(&Record, usize)>> {
        counter
            .most_common_ordered()
            .into_iter()
            .filter(|(_, size)| *size >= threshold && *size > 0)
            .map(|(dataset_id, size)| Ok((self.collection.record_for_dataset(dataset_id)?, size)))
            .collect()
    }

    /// Build the counters used by [`RevIndex::gather`].
    pub fn prepare_gather_counters(&self, query: &KmerMinHash) -> Result<GatherCounters> {
        let mut counters = GatherCounters::default();
        for (hash, datasets) in self.lookup(query)? {
            counters.counter.update(datasets.clone());
            counters.hash_to_datasets.insert(hash, datasets);
        }
        Ok(counters)
    }

    /// Greedy min-set-cov of `query` using only the inverted index.
    ///
    /// Each rank picks the dataset sharing the most remaining query hashes,
    /// ties broken by original overlap, then name, then md5. Hashes covered
    /// by a match are removed from the residual query and from the counts
    /// of every other dataset holding them.
    pub fn gather(
        &self,
        counters: GatherCounters,
        threshold: usize,
        query: &SmallSignature,
    ) -> Result<Vec<GatherResult>> {
        let GatherCounters {
            mut counter,
            mut hash_to_datasets,
        } = counters;
        let orig_counter = counter.clone();
        let threshold = threshold.max(1);

        let mut residual = query.minhash.size();
        let mut results = vec![];

        while residual > 0 {
            let mut best: Option<(CandidateKey, Idx, &Record)> = None;
            for (&dataset_id, &overlap) in counter.iter() {
                if overlap < threshold {
                    continue;
                }
                let record = self.collection.record_for_dataset(dataset_id)?;
                let key = CandidateKey::new(
                    overlap,
                    orig_counter[&dataset_id],
                    record.name(),
                    record.md5(),
                );
                if best.as_ref().map_or(true, |(current, ..)| key > *current) {
                    best = Some((key, dataset_id, record));
                }
            }

            let (best_id, record) = match best {
                Some((_, dataset_id, record)) => (dataset_id, record),
                None => break,
            };

            let consumed: Vec<HashIntoType> = hash_to_datasets
                .iter()
                .filter(|(_, datasets)| datasets.contains(best_id))
                .map(|(hash, _)| *hash)
                .collect();
            for hash in &consumed {
                if let Some(datasets) = hash_to_datasets.remove(hash) {
                    for dataset_id in datasets {
                        if let Some(count) = counter.get_mut(&dataset_id) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }
            counter.retain(|_, count| *count > 0);

            let overlap = consumed.len();
            residual = residual.saturating_sub(overlap);
            trace!(
                "rank {}: '{}' overlap {}, residual {}",
                results.len(),
                record.name(),
                overlap,
                residual
            );

            let rank = RankOverlap {
                rank: results.len(),
                overlap,
                orig_overlap: orig_counter[&best_id],
                match_size: *record.n_hashes(),
                remaining_hashes: residual,
            };
            results.push(GatherResult::from_rank(
                query,
                record.name(),
                record.md5(),
                &rank,
            ));
        }

        Ok(results)
    }
}
