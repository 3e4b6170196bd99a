use std::ops::{Deref, DerefMut};

use camino::Utf8Path as Path;
use log::debug;
use rayon::prelude::*;

use crate::encodings::Idx;
use crate::manifest::{Manifest, Record};
use crate::selection::{Select, Selection};
use crate::signature::Signature;
use crate::sketch::minhash::KmerMinHash;
use crate::storage::{FSStorage, InnerStorage, MemStorage, Storage, ZipStorage, MANIFEST_NAME};
use crate::{Error, Result};

/// A sketch loaded for comparison, tracking where it came from.
///
/// `md5sum` is the md5 of the sketch as stored, before any downsampling.
#[derive(Debug, Clone)]
pub struct SmallSignature {
    pub location: String,
    pub name: String,
    pub md5sum: String,
    pub minhash: KmerMinHash,
}

#[derive(Clone)]
pub struct Collection {
    manifest: Manifest,
    storage: InnerStorage,
    scaled: Option<u64>,
}

/// A collection where every record shares ksize, moltype and scaled.
#[derive(Clone)]
pub struct CollectionSet {
    collection: Collection,
}

impl Deref for CollectionSet {
    type Target = Collection;

    fn deref(&self) -> &Self::Target {
        &self.collection
    }
}

impl DerefMut for CollectionSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.collection
    }
}

impl TryFrom<Collection> for CollectionSet {
    type Error = crate::Error;

    fn try_from(collection: Collection) -> Result<Self> {
        let first = if let Some(first) = collection.manifest.first() {
            first
        } else {
            // empty collection is consistent
            return Ok(Self { collection });
        };

        collection
            .manifest
            .iter()
            .skip(1)
            .try_for_each(|c| first.check_compatible(c))?;

        if collection.scaled.is_none() && collection.manifest.scaled_values().len() > 1 {
            return Err(Error::MismatchScaled);
        }

        Ok(Self { collection })
    }
}

impl CollectionSet {
    pub fn into_inner(self) -> Collection {
        self.collection
    }

    /// Selection matching every record in this set.
    pub fn selection(&self) -> Result<Selection> {
        let mut selection = match self.manifest.first() {
            Some(first) => Selection::from_record(first)?,
            None => Selection::default(),
        };
        if let Some(scaled) = self.scaled() {
            selection.set_scaled(scaled);
        }
        Ok(selection)
    }
}

impl Collection {
    pub fn new(manifest: Manifest, storage: InnerStorage) -> Self {
        Self {
            manifest,
            storage,
            scaled: None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Idx, &Record)> {
        self.manifest.iter().enumerate().map(|(i, r)| (i as Idx, r))
    }

    pub fn par_iter(&self) -> impl IndexedParallelIterator<Item = (Idx, &Record)> {
        self.manifest
            .par_iter()
            .enumerate()
            .map(|(i, r)| (i as Idx, r))
    }

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.len() == 0
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn storage(&self) -> &InnerStorage {
        &self.storage
    }

    /// Scaled every loaded sketch is brought to.
    ///
    /// Falls back to the largest scaled in the manifest.
    pub fn scaled(&self) -> Option<u64> {
        self.scaled
            .or_else(|| self.manifest.scaled_values().into_iter().next_back())
    }

    pub fn from_zipfile<P: AsRef<Path>>(zipfile: P) -> Result<Self> {
        let storage = ZipStorage::from_file(zipfile)?;

        let manifest = if storage.has_manifest()? {
            Manifest::from_reader(storage.load(MANIFEST_NAME)?.as_slice())?
        } else {
            debug!("no manifest in '{}', scanning entries", storage.path());
            let mut records = vec![];
            for entry in storage.filenames()? {
                if !is_sig_filename(&entry) {
                    continue;
                }
                for sig in storage.load_sigs(&entry)? {
                    records.extend(Record::from_sig(&sig, &entry));
                }
            }
            records.into()
        };

        Ok(Self::new(manifest, storage.into()))
    }

    /// Collection over one signature file, referencing it by path.
    pub fn from_sigfile<P: AsRef<Path>>(sigfile: P) -> Result<Self> {
        let path = sigfile.as_ref();
        let records: Vec<Record> = Signature::from_path(path)
            .map_err(|e| Error::LoadFailure {
                path: path.to_string(),
                message: e.to_string(),
            })?
            .iter()
            .flat_map(|sig| Record::from_sig(sig, path.as_str()))
            .collect();

        Ok(Self::new(records.into(), FSStorage::new("", "").into()))
    }

    pub fn from_sigs(sigs: Vec<Signature>) -> Result<Self> {
        let storage = MemStorage::new();

        let mut records = vec![];
        for (i, sig) in sigs.into_iter().enumerate() {
            let path = format!("{}", i);
            let mut record = Record::from_sig(&sig, &path);
            let path = storage.save_sig(&path, &sig)?;
            record.iter_mut().for_each(|rec| {
                rec.set_internal_location(path.clone().into());
            });
            records.extend(record);
        }

        Ok(Self::new(records.into(), storage.into()))
    }

    pub fn record_for_dataset(&self, dataset_id: Idx) -> Result<&Record> {
        self.manifest
            .get(dataset_id as usize)
            .ok_or_else(|| Error::Internal {
                message: format!("dataset {dataset_id} not in manifest"),
            })
    }

    pub fn sig_for_dataset(&self, dataset_id: Idx) -> Result<Signature> {
        self.sig_from_record(self.record_for_dataset(dataset_id)?)
    }

    /// Load the sketch described by `record`, downsampled to this
    /// collection's scaled.
    ///
    /// Renamed copies of one sketch share an md5, so the name picks between
    /// them; a sketch whose name differs from the record is only used when
    /// no name matches.
    pub fn sig_from_record(&self, record: &Record) -> Result<Signature> {
        let location = record.internal_location().as_str();
        let mut fallback = None;
        for mut sig in self.storage.load_sigs(location)? {
            let sketches = std::mem::take(&mut sig.signatures);
            let Some(mh) = sketches.into_iter().find(|mh| mh.md5sum() == *record.md5()) else {
                continue;
            };
            let same_name = sig.name() == *record.name();
            sig.signatures = vec![mh];
            if same_name {
                return self.rescaled(sig);
            }
            if fallback.is_none() {
                fallback = Some(sig);
            }
        }
        match fallback {
            Some(sig) => self.rescaled(sig),
            None => Err(Error::DataNotFound {
                path: format!("{} (md5 {})", location, record.md5()),
            }),
        }
    }

    fn rescaled(&self, mut sig: Signature) -> Result<Signature> {
        let downsampled = match (self.scaled, sig.signatures.first()) {
            (Some(scaled), Some(mh)) if mh.scaled() < scaled => Some(mh.downsample_scaled(scaled)?),
            _ => None,
        };
        if let Some(mh) = downsampled {
            sig.signatures = vec![mh];
        }
        Ok(sig)
    }

    pub fn small_sig_from_record(&self, record: &Record) -> Result<SmallSignature> {
        let sig = self.sig_from_record(record)?;
        let minhash = sig.minhash().cloned().ok_or_else(|| Error::DataNotFound {
            path: record.internal_location().to_string(),
        })?;
        Ok(SmallSignature {
            location: record.internal_location().to_string(),
            name: sig.name(),
            md5sum: record.md5().clone(),
            minhash,
        })
    }

    pub(crate) fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn intersect_manifest(mut self, manifest: &Manifest) -> Self {
        self.manifest = self.manifest.intersect_manifest(manifest);
        self
    }

    /// Resolve every record location against the storage base, when it is a
    /// filesystem storage.
    pub(crate) fn absolute_locations(self) -> Option<Self> {
        let base = match &self.storage {
            InnerStorage::FS(fs) => fs.fullpath().to_owned(),
            _ => return None,
        };
        let manifest = self
            .manifest
            .iter()
            .cloned()
            .map(|mut r| {
                let loc = base.join(r.internal_location());
                r.set_internal_location(loc);
                r
            })
            .collect();
        Some(Self {
            manifest,
            storage: FSStorage::new("", "").into(),
            scaled: self.scaled,
        })
    }
}

pub(crate) fn is_sig_filename(path: &str) -> bool {
    path.ends_with(".sig") || path.ends_with(".sig.gz") || path.ends_with(".json")
}

impl Select for Collection {
    fn select(mut self, selection: &Selection) -> Result<Self> {
        self.manifest = self.manifest.select(selection)?;
        if let Some(scaled) = selection.scaled() {
            self.scaled = Some(scaled);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use camino::Utf8PathBuf as PathBuf;

    use super::*;
    use crate::encodings::HashFunctions;
    use crate::sketch::minhash::max_hash_for_scaled;
    use crate::storage::ToWriter;

    fn mh(ksize: u32, scaled: u64, hashes: &[u64]) -> KmerMinHash {
        let mut mh = KmerMinHash::builder()
            .ksize(ksize)
            .max_hash(max_hash_for_scaled(scaled))
            .build();
        mh.add_many(hashes);
        mh
    }

    fn sig(name: &str, sketches: Vec<KmerMinHash>) -> Signature {
        Signature::builder().name(name).signatures(sketches).build()
    }

    #[test]
    fn sig_from_record_picks_sketch_by_md5() {
        let s = sig("multi", vec![mh(21, 10, &[1, 2]), mh(31, 10, &[3, 4, 5])]);
        let collection = Collection::from_sigs(vec![s]).unwrap();
        assert_eq!(collection.len(), 2);

        let selection = Selection::builder().ksize(31).build();
        let collection = collection.select(&selection).unwrap();
        assert_eq!(collection.len(), 1);

        let loaded = collection.sig_for_dataset(0).unwrap();
        assert_eq!(loaded.minhash().unwrap().ksize(), 31);
        assert_eq!(loaded.minhash().unwrap().mins(), &[3, 4, 5]);
        assert_eq!(loaded.name(), "multi");
    }

    #[test]
    fn renamed_copies_in_one_file_load_separately() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = PathBuf::from_path_buf(tmp.path().join("copies.sig")).unwrap();
        let sigs = vec![
            sig("original", vec![mh(31, 10, &[1, 2, 3])]),
            sig("renamed", vec![mh(31, 10, &[1, 2, 3])]),
        ];
        serde_json::to_writer(std::fs::File::create(&path).unwrap(), &sigs).unwrap();

        let collection = Collection::from_sigfile(&path).unwrap();
        assert_eq!(collection.len(), 2);
        let names: Vec<String> = collection
            .manifest()
            .iter()
            .map(|r| collection.small_sig_from_record(r).unwrap().name)
            .collect();
        assert_eq!(names, ["original", "renamed"]);
    }

    #[test]
    fn select_downsamples_on_load() {
        let max_1000 = max_hash_for_scaled(1000);
        let s = sig("low", vec![mh(31, 100, &[1, max_1000 + 10])]);
        let collection = Collection::from_sigs(vec![s])
            .unwrap()
            .select(&Selection::builder().scaled(1000).build())
            .unwrap();

        let small = collection
            .small_sig_from_record(&collection.manifest()[0])
            .unwrap();
        assert_eq!(small.minhash.scaled(), 1000);
        assert_eq!(small.minhash.mins(), &[1]);
        // md5 of the stored sketch, not the downsampled one
        assert_eq!(&small.md5sum, collection.manifest()[0].md5());
    }

    #[test]
    fn collection_set_rejects_mixed_ksizes() {
        let collection = Collection::from_sigs(vec![
            sig("a", vec![mh(21, 10, &[1])]),
            sig("b", vec![mh(31, 10, &[1])]),
        ])
        .unwrap();
        assert!(matches!(
            CollectionSet::try_from(collection),
            Err(Error::MismatchKSizes)
        ));
    }

    #[test]
    fn collection_set_rejects_mixed_scaled_without_target() {
        let collection = Collection::from_sigs(vec![
            sig("a", vec![mh(31, 10, &[1])]),
            sig("b", vec![mh(31, 100, &[1])]),
        ])
        .unwrap();
        assert!(matches!(
            CollectionSet::try_from(collection.clone()),
            Err(Error::MismatchScaled)
        ));

        let selected = collection
            .select(&Selection::builder().scaled(100).build())
            .unwrap();
        let set = CollectionSet::try_from(selected).unwrap();
        assert_eq!(set.selection().unwrap().scaled(), Some(100));
    }

    #[test]
    fn zipfile_without_manifest_is_scanned() {
        let tmp = tempfile::TempDir::new().unwrap();
        let zippath = PathBuf::from_path_buf(tmp.path().join("sigs.zip")).unwrap();

        {
            let file = std::fs::File::create(&zippath).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (i, name) in ["first", "second"].iter().enumerate() {
                let mut buf = vec![];
                sig(name, vec![mh(31, 10, &[i as u64 + 1])])
                    .to_writer(&mut buf)
                    .unwrap();
                zip.start_file(format!("signatures/{name}.sig"), options)
                    .unwrap();
                zip.write_all(&buf).unwrap();
            }
            zip.start_file("README.txt", options).unwrap();
            zip.write_all(b"not a sketch").unwrap();
            zip.finish().unwrap();
        }

        let collection = Collection::from_zipfile(&zippath).unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.sig_for_dataset(1).unwrap().name(), "second");
        assert_eq!(collection.storage().spec(), format!("zip://{}", zippath));
    }
}
