//! MultiCollection: sketches coming from many files and containers.
//!
//! Loading resolves nested sources (pathlists naming manifests naming
//! archives, and so on) down to concrete collections. Nesting is bounded by
//! [`MAX_LOAD_DEPTH`] and a source that reappears among its own ancestors
//! is rejected.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path as Path, Utf8PathBuf as PathBuf};
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::collection::{is_sig_filename, Collection, SmallSignature};
use crate::encodings::Idx;
use crate::index::revindex::RevIndex;
use crate::manifest::{Manifest, Record};
use crate::selection::{Select, Selection};
use crate::signature::Signature;
use crate::storage::{FSStorage, InnerStorage, Storage};
use crate::{Error, Result};

pub const MAX_LOAD_DEPTH: usize = 8;

/// Counts reported after loading a collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// sketches matching the selection
    pub n_loaded: usize,
    /// sketches dropped by the selection
    pub n_skipped: usize,
    /// paths that could not be loaded
    pub n_failed: usize,
}

/// A collection of sketches, potentially stored in multiple files.
#[derive(Clone, Default)]
pub struct MultiCollection {
    collections: Vec<Collection>,
    contains_revindex: bool,
}

pub fn is_revindex_database(path: &Path) -> bool {
    // a RocksDB directory always holds a CURRENT file
    if path.is_dir() {
        let current_file = path.join("CURRENT");
        current_file.exists() && current_file.is_file()
    } else {
        false
    }
}

struct Loader {
    n_failed: AtomicUsize,
}

impl Loader {
    fn resolve(&self, path: &Path, ancestors: &[PathBuf]) -> Result<MultiCollection> {
        let depth = ancestors.len();
        if depth > MAX_LOAD_DEPTH {
            return Err(Error::LoadCycle {
                path: path.to_string(),
                depth: MAX_LOAD_DEPTH,
            });
        }

        let canonical = path.canonicalize_utf8().map_err(|_| Error::MissingPath {
            path: path.to_string(),
        })?;
        if ancestors.contains(&canonical) {
            return Err(Error::LoadCycle {
                path: path.to_string(),
                depth,
            });
        }

        if is_revindex_database(path) {
            debug!("loading '{}' as a RevIndex", path);
            let collection = RevIndex::open(path, true)?.collection().clone().into_inner();
            return Ok(MultiCollection::new(vec![collection], true));
        }

        let mut chain = ancestors.to_vec();
        chain.push(canonical.clone());

        match path.as_str() {
            p if p.ends_with(".zip") => {
                debug!("loading sigs from zipfile {}", p);
                match Collection::from_zipfile(&canonical) {
                    Ok(coll) => Ok(coll.into()),
                    Err(zip_err) => {
                        debug!("'{}' is not a zip archive ({}), trying as sigfile", p, zip_err);
                        Ok(Collection::from_sigfile(&canonical)?.into())
                    }
                }
            }
            p if p.ends_with(".csv") => self.from_standalone_manifest(path, &chain),
            p if is_sig_filename(p) => {
                debug!("loading sigs from sigfile {}", p);
                Ok(Collection::from_sigfile(&canonical)?.into())
            }
            p => match Collection::from_sigfile(&canonical) {
                Ok(coll) => Ok(coll.into()),
                Err(_) => {
                    debug!("'{}' is not a signature file, reading as pathlist", p);
                    self.from_pathlist(path, &chain)
                }
            },
        }
    }

    /// Resolve each location, counting failures instead of stopping.
    fn resolve_many(
        &self,
        locations: Vec<String>,
        base: Option<&Path>,
        ancestors: &[PathBuf],
    ) -> Result<MultiCollection> {
        let colls: Vec<MultiCollection> = locations
            .par_iter()
            .map(|loc| {
                let path = locate(loc, base);
                match self.resolve(&path, ancestors) {
                    Ok(multi) => Ok(Some(multi)),
                    Err(e @ Error::LoadCycle { .. }) => Err(e),
                    Err(e) => {
                        warn!("could not load sketches from path '{}': {}", loc, e);
                        self.n_failed.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        Ok(MultiCollection::from(colls))
    }

    fn from_pathlist(&self, sigpath: &Path, ancestors: &[PathBuf]) -> Result<MultiCollection> {
        debug!("multi from pathlist!");
        let file = File::open(sigpath)?;
        let reader = BufReader::new(file);

        let mut lines = vec![];
        for line in reader.lines() {
            let line = line.map_err(|e| Error::LoadFailure {
                path: sigpath.to_string(),
                message: e.to_string(),
            })?;
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        let lines: Vec<String> = lines.into_iter().unique().collect();

        self.resolve_many(lines, sigpath.parent(), ancestors)
    }

    /// Build from a standalone manifest, keeping only the rows it lists.
    fn from_standalone_manifest(
        &self,
        sigpath: &Path,
        ancestors: &[PathBuf],
    ) -> Result<MultiCollection> {
        debug!("multi from standalone manifest!");
        let file = File::open(sigpath)?;
        let manifest =
            Manifest::from_reader(BufReader::new(file)).map_err(|e| Error::LoadFailure {
                path: sigpath.to_string(),
                message: format!("could not read as manifest: {e}"),
            })?;
        debug!("got {} records from standalone manifest", manifest.len());

        if manifest.is_empty() {
            return Err(Error::LoadFailure {
                path: sigpath.to_string(),
                message: "could not read as manifest".into(),
            });
        }

        let ilocs = manifest
            .unique_locations()
            .into_iter()
            .map(String::from)
            .collect();
        let colls = self.resolve_many(ilocs, sigpath.parent(), ancestors)?;

        Ok(colls.intersect_manifest(&manifest))
    }
}

/// Locations are tried as given, then relative to `base`.
fn locate(loc: &str, base: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(loc);
    if path.exists() || path.is_absolute() {
        return path;
    }
    match base {
        Some(base) if base.join(&path).exists() => base.join(&path),
        _ => path,
    }
}

impl MultiCollection {
    fn new(collections: Vec<Collection>, contains_revindex: bool) -> Self {
        Self {
            collections,
            contains_revindex,
        }
    }

    /// Load every sketch reachable from `path` that matches `selection`.
    ///
    /// Sources that fail to load are counted in the report; unless
    /// `allow_failed` is set they make the load fail once every source was
    /// attempted.
    pub fn load<P: AsRef<Path>>(
        path: P,
        selection: &Selection,
        allow_failed: bool,
    ) -> Result<(Self, LoadReport)> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingPath {
                path: path.to_string(),
            });
        }

        let loader = Loader {
            n_failed: AtomicUsize::new(0),
        };
        let multi = loader.resolve(path, &[])?;
        let n_failed = loader.n_failed.into_inner();

        let n_total = multi.len();
        let multi = multi.select(selection)?.dedup();
        let report = LoadReport {
            n_loaded: multi.len(),
            n_skipped: n_total.saturating_sub(multi.len()),
            n_failed,
        };

        info!(
            "Loaded {} sketch(es) from '{}'",
            report.n_loaded,
            path
        );
        if report.n_skipped > 0 {
            warn!(
                "skipped {} of {} sketches from '{}' not matching the selection",
                report.n_skipped, n_total, path
            );
        }
        if report.n_failed > 0 {
            warn!("{} paths failed to load from '{}'", report.n_failed, path);
            if !allow_failed {
                return Err(Error::FailedPaths {
                    path: path.to_string(),
                    failed: report.n_failed,
                });
            }
        }
        if multi.is_empty() {
            return Err(Error::EmptyCollection {
                path: path.to_string(),
            });
        }

        Ok((multi, report))
    }

    pub fn len(&self) -> usize {
        self.collections.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_revindex(&self) -> bool {
        self.contains_revindex
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    // iterate over tuples
    pub fn item_iter(&self) -> impl Iterator<Item = (&Collection, Idx, &Record)> {
        self.collections
            .iter()
            .flat_map(|c| c.iter().map(move |(idx, record)| (c, idx, record)))
    }

    pub fn par_iter(&self) -> impl IndexedParallelIterator<Item = (&Collection, Idx, &Record)> {
        let s: Vec<_> = self.item_iter().collect();
        s.into_par_iter()
    }

    pub fn get_first_sig(&self) -> Option<Signature> {
        let (coll, _, record) = self.item_iter().next()?;
        coll.sig_from_record(record).ok()
    }

    /// Distinct `(ksize, moltype)` pairs and scaled values present.
    fn parameters(&self) -> Result<(Vec<(u32, String)>, Vec<u64>)> {
        let mut params = HashSet::new();
        let mut scaled = HashSet::new();
        for (_, _, record) in self.item_iter() {
            params.insert((*record.ksize(), record.moltype()?.to_string()));
            scaled.insert(*record.scaled());
        }
        Ok((
            params.into_iter().sorted().collect(),
            scaled.into_iter().sorted().collect(),
        ))
    }

    /// Pin `selection` to the single ksize, moltype and scaled used by this
    /// collection.
    ///
    /// Several scaled values are only accepted with `rescale`, which picks
    /// the largest one; everything else is downsampled on load.
    pub fn select_uniform(
        self,
        selection: &Selection,
        rescale: bool,
        source: &str,
    ) -> Result<(Self, Selection)> {
        let (params, scaled_values) = self.parameters()?;

        if params.len() > 1 {
            let moltypes: HashSet<_> = params.iter().map(|(_, m)| m).collect();
            return if moltypes.len() > 1 {
                Err(Error::MismatchDNAProt)
            } else {
                Err(Error::MismatchKSizes)
            };
        }

        let mut selection = selection.clone();
        if let Some((ksize, moltype)) = params.first() {
            selection.set_ksize(*ksize);
            selection.set_moltype(moltype.as_str().try_into()?);
        }

        if selection.scaled().is_none() {
            match scaled_values.as_slice() {
                [] => {}
                [single] => selection.set_scaled(*single),
                [.., max] if rescale => {
                    info!("rescaling all sketches from '{}' to scaled={}", source, max);
                    selection.set_scaled(*max);
                }
                values => {
                    return Err(Error::MultipleScaled {
                        path: source.into(),
                        values: values.iter().join(", "),
                    })
                }
            }
        }

        let multi = self.select(&selection)?;
        Ok((multi, selection))
    }

    /// Load all sketches into memory, skipping the ones that fail.
    pub fn load_sketches(&self) -> Vec<SmallSignature> {
        if self.contains_revindex {
            warn!("loading all sketches from a RocksDB into memory!");
        }
        let n_failed = AtomicUsize::new(0);
        let sketches: Vec<SmallSignature> = self
            .par_iter()
            .filter_map(|(coll, _idx, record)| match coll.small_sig_from_record(record) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    warn!(
                        "FAILED to load sketch from '{}': {}",
                        record.internal_location(),
                        e
                    );
                    n_failed.fetch_add(1, Ordering::SeqCst);
                    None
                }
            })
            .collect();

        let n_failed = n_failed.into_inner();
        if n_failed > 0 {
            warn!("{} of {} sketches failed to load", n_failed, self.len());
        }
        sketches
    }

    fn intersect_manifest(self, manifest: &Manifest) -> MultiCollection {
        let colls = self
            .collections
            .into_iter()
            .map(|c| c.intersect_manifest(manifest))
            .collect();
        MultiCollection::new(colls, self.contains_revindex)
    }

    /// Drop records already seen in this or an earlier collection.
    fn dedup(self) -> Self {
        let mut seen = HashSet::new();
        let colls = self
            .collections
            .into_iter()
            .map(|c| {
                let spec = c.storage().spec();
                let manifest: Manifest = c
                    .manifest()
                    .iter()
                    .filter(|r| {
                        let (name, md5, loc) = r.identity();
                        seen.insert((
                            spec.clone(),
                            name.to_string(),
                            md5.to_string(),
                            loc.to_string(),
                        ))
                    })
                    .cloned()
                    .collect();
                c.with_manifest(manifest)
            })
            .collect();
        MultiCollection::new(colls, self.contains_revindex)
    }

    /// Load all sketches into memory, producing an in-memory Collection.
    pub fn load_all_sigs(self) -> Result<Collection> {
        let scaled = self.collections.iter().filter_map(|c| c.scaled()).max();
        let all_sigs: Vec<Signature> = self
            .par_iter()
            .map(|(coll, _idx, record)| coll.sig_from_record(record))
            .collect::<Result<Vec<_>>>()?;
        let collection = Collection::from_sigs(all_sigs)?;
        match scaled {
            Some(scaled) => collection.select(&Selection::builder().scaled(scaled).build()),
            None => Ok(collection),
        }
    }

    /// Turn into a single collection suitable for indexing.
    ///
    /// With `external`, the result must reference sketches by stable paths.
    pub fn into_collection(self, external: bool) -> Result<Collection> {
        if self.collections.len() == 1 {
            let coll = self.collections.into_iter().next().ok_or_else(|| Error::Internal {
                message: "no collection".into(),
            })?;
            if external && !coll.storage().is_external() {
                return Err(Error::ExternalStorageUnavailable {
                    message: format!("sketches in '{}' have no stable path", coll.storage().spec()),
                });
            }
            return Ok(coll);
        }

        let all_fs = self
            .collections
            .iter()
            .all(|c| matches!(c.storage(), InnerStorage::FS(_)));

        if all_fs {
            let scaled = self.collections.iter().filter_map(|c| c.scaled()).max();
            let mut records = vec![];
            for coll in self.collections {
                if let Some(coll) = coll.absolute_locations() {
                    records.extend(coll.manifest().iter().cloned());
                }
            }
            let merged = Collection::new(records.into(), FSStorage::new("", "").into());
            return match scaled {
                Some(scaled) => merged.select(&Selection::builder().scaled(scaled).build()),
                None => Ok(merged),
            };
        }

        if external {
            return Err(Error::ExternalStorageUnavailable {
                message: "cannot index this type of collection with external storage".into(),
            });
        }

        warn!("loading all sketches into memory in order to index.");
        self.load_all_sigs()
    }
}

impl Select for MultiCollection {
    fn select(self, selection: &Selection) -> Result<Self> {
        let collections = self
            .collections
            .into_iter()
            .map(|c| c.select(selection))
            .collect::<Result<Vec<_>>>()?;

        Ok(MultiCollection::new(collections, self.contains_revindex))
    }
}

// Convert a single Collection into a MultiCollection
impl From<Collection> for MultiCollection {
    fn from(coll: Collection) -> Self {
        MultiCollection::new(vec![coll], false)
    }
}

// Merge a bunch of MultiCollection structs into one
impl From<Vec<MultiCollection>> for MultiCollection {
    fn from(multi: Vec<MultiCollection>) -> Self {
        let contains_revindex = multi.iter().any(|m| m.contains_revindex);
        let collections = multi.into_iter().flat_map(|m| m.collections).collect();
        MultiCollection::new(collections, contains_revindex)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::encodings::HashFunctions;
    use crate::sketch::minhash::{max_hash_for_scaled, KmerMinHash};
    use crate::storage::ToWriter;

    fn write_sig(dir: &Path, filename: &str, name: &str, ksize: u32, scaled: u64) -> PathBuf {
        let mut mh = KmerMinHash::builder()
            .ksize(ksize)
            .max_hash(max_hash_for_scaled(scaled))
            .build();
        mh.add_many(&[1, 2, 3, ksize as u64]);
        let sig = Signature::builder().name(name).signatures(vec![mh]).build();

        let path = dir.join(filename);
        let mut out = File::create(&path).unwrap();
        sig.to_writer(&mut out).unwrap();
        path
    }

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut out = File::create(path).unwrap();
        for line in lines {
            writeln!(out, "{}", line).unwrap();
        }
    }

    fn tmpdir() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        (tmp, dir)
    }

    #[test]
    fn pathlist_reports_skipped() {
        let (_tmp, dir) = tmpdir();
        let a = write_sig(&dir, "a.sig", "a", 31, 10);
        let b = write_sig(&dir, "b.sig", "b", 31, 10);
        let c = write_sig(&dir, "c.sig", "c", 21, 10);
        let list = dir.join("list.txt");
        write_lines(&list, &[a.as_str(), "", b.as_str(), c.as_str(), a.as_str()]);

        let selection = Selection::builder().ksize(31).build();
        let (multi, report) = MultiCollection::load(&list, &selection, false).unwrap();
        assert_eq!(multi.len(), 2);
        assert_eq!(
            report,
            LoadReport {
                n_loaded: 2,
                n_skipped: 1,
                n_failed: 0
            }
        );
    }

    #[test]
    fn renamed_copies_with_same_md5_are_kept() {
        let (_tmp, dir) = tmpdir();
        let mut mh = KmerMinHash::builder()
            .ksize(31)
            .max_hash(max_hash_for_scaled(10))
            .build();
        mh.add_many(&[1, 2, 3]);
        let sigs: Vec<Signature> = ["first", "second"]
            .iter()
            .map(|name| {
                Signature::builder()
                    .name(*name)
                    .signatures(vec![mh.clone()])
                    .build()
            })
            .collect();
        let path = dir.join("copies.sig");
        serde_json::to_writer(File::create(&path).unwrap(), &sigs).unwrap();

        let (multi, report) = MultiCollection::load(&path, &Selection::default(), false).unwrap();
        assert_eq!(report.n_loaded, 2);
        assert_eq!(report.n_skipped, 0);

        let names: HashSet<String> = multi.load_sketches().into_iter().map(|s| s.name).collect();
        assert_eq!(names, HashSet::from(["first".to_string(), "second".to_string()]));
    }

    #[test]
    fn everything_mismatched_is_empty() {
        let (_tmp, dir) = tmpdir();
        let c = write_sig(&dir, "c.sig", "c", 21, 10);
        let list = dir.join("list.txt");
        write_lines(&list, &[c.as_str()]);

        let selection = Selection::builder().ksize(31).build();
        let err = MultiCollection::load(&list, &selection, false).unwrap_err();
        assert!(err.to_string().contains("no sketches loaded"));
    }

    #[test]
    fn missing_entries_fail_unless_allowed() {
        let (_tmp, dir) = tmpdir();
        let a = write_sig(&dir, "a.sig", "a", 31, 10);
        let list = dir.join("list.txt");
        write_lines(&list, &[a.as_str(), "no-exist"]);

        let selection = Selection::default();
        assert!(matches!(
            MultiCollection::load(&list, &selection, false),
            Err(Error::FailedPaths { failed: 1, .. })
        ));

        let (multi, report) = MultiCollection::load(&list, &selection, true).unwrap();
        assert_eq!(multi.len(), 1);
        assert_eq!(report.n_failed, 1);
    }

    #[test]
    fn self_referencing_pathlist_is_a_cycle() {
        let (_tmp, dir) = tmpdir();
        let a = write_sig(&dir, "a.sig", "a", 31, 10);
        let list = dir.join("list.txt");
        write_lines(&list, &[a.as_str(), list.as_str()]);

        let err = MultiCollection::load(&list, &Selection::default(), true).unwrap_err();
        assert!(matches!(err, Error::LoadCycle { .. }));
    }

    #[test]
    fn standalone_manifest_with_relative_locations() {
        let (_tmp, dir) = tmpdir();
        let sub = dir.join("sub");
        std::fs::create_dir(&sub).unwrap();
        write_sig(&sub, "a.sig", "a", 31, 10);
        write_sig(&sub, "b.sig", "b", 31, 10);

        // manifest lists only "a", by a location relative to the manifest
        let a_only = Collection::from_sigfile(sub.join("a.sig")).unwrap();
        let records: Vec<Record> = a_only
            .manifest()
            .iter()
            .cloned()
            .map(|mut r| {
                r.set_internal_location("a.sig".into());
                r
            })
            .collect();
        let mf = sub.join("mf.csv");
        Manifest::from(records)
            .to_writer(File::create(&mf).unwrap())
            .unwrap();

        let (multi, _) = MultiCollection::load(&mf, &Selection::default(), false).unwrap();
        assert_eq!(multi.len(), 1);
        assert_eq!(multi.get_first_sig().unwrap().name(), "a");
    }

    #[test]
    fn multiple_scaled_need_rescale() {
        let (_tmp, dir) = tmpdir();
        let a = write_sig(&dir, "a.sig", "a", 31, 10);
        let b = write_sig(&dir, "b.sig", "b", 31, 100);
        let list = dir.join("list.txt");
        write_lines(&list, &[a.as_str(), b.as_str()]);

        let (multi, _) = MultiCollection::load(&list, &Selection::default(), false).unwrap();
        let err = multi
            .clone()
            .select_uniform(&Selection::default(), false, list.as_str())
            .unwrap_err();
        assert!(matches!(err, Error::MultipleScaled { .. }));

        let (multi, selection) = multi
            .select_uniform(&Selection::default(), true, list.as_str())
            .unwrap();
        assert_eq!(selection.scaled(), Some(100));
        assert_eq!(selection.ksize(), Some(31));
        assert_eq!(multi.len(), 2);
        let sketches = multi.load_sketches();
        assert!(sketches.iter().all(|s| s.minhash.scaled() == 100));
    }

    #[test]
    fn mixed_moltypes_are_rejected() {
        let (_tmp, dir) = tmpdir();
        let a = write_sig(&dir, "a.sig", "a", 31, 10);
        let mut mh = KmerMinHash::new(10, 10, HashFunctions::murmur64_protein, 42);
        mh.add_hash(1);
        let sig = Signature::builder().name("prot").signatures(vec![mh]).build();
        let p = dir.join("p.sig");
        sig.to_writer(&mut File::create(&p).unwrap()).unwrap();

        let list = dir.join("list.txt");
        write_lines(&list, &[a.as_str(), p.as_str()]);

        let (multi, _) = MultiCollection::load(&list, &Selection::default(), false).unwrap();
        assert!(matches!(
            multi.select_uniform(&Selection::default(), true, "list"),
            Err(Error::MismatchDNAProt)
        ));
    }

    #[test]
    fn merged_sigfiles_stay_external() {
        let (_tmp, dir) = tmpdir();
        let a = write_sig(&dir, "a.sig", "a", 31, 10);
        let b = write_sig(&dir, "b.sig", "b", 31, 10);
        let list = dir.join("list.txt");
        write_lines(&list, &[a.as_str(), b.as_str()]);

        let (multi, _) = MultiCollection::load(&list, &Selection::default(), false).unwrap();
        let coll = multi.into_collection(true).unwrap();
        assert_eq!(coll.len(), 2);
        assert!(coll.storage().is_external());
        assert_eq!(coll.sig_for_dataset(1).unwrap().minhash().unwrap().size(), 4);
    }
}
