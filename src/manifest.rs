use std::collections::{BTreeSet, HashSet};
use std::convert::TryInto;
use std::io::{Read, Write};
use std::ops::Deref;

use camino::Utf8PathBuf as PathBuf;
use getset::{CopyGetters, Getters, Setters};
use serde::de;
use serde::{Deserialize, Serialize};

use crate::encodings::HashFunctions;
use crate::selection::{Select, Selection};
use crate::signature::Signature;
use crate::Result;

pub const MANIFEST_HEADER: &[u8] = b"# SOURMASH-MANIFEST-VERSION: 1.0\n";

#[derive(Debug, Serialize, Deserialize, Clone, CopyGetters, Getters, Setters, PartialEq)]
pub struct Record {
    #[getset(get = "pub", set = "pub")]
    internal_location: PathBuf,

    #[getset(get = "pub", set = "pub")]
    md5: String,

    #[getset(get = "pub")]
    md5short: String,

    #[getset(get = "pub", set = "pub")]
    ksize: u32,

    moltype: String,

    #[getset(get = "pub")]
    num: u32,

    #[getset(get = "pub", set = "pub(crate)")]
    scaled: u64,

    #[getset(get = "pub", set = "pub(crate)")]
    n_hashes: usize,

    #[getset(get = "pub", set = "pub")]
    #[serde(serialize_with = "intbool", deserialize_with = "to_bool")]
    with_abundance: bool,

    #[getset(get = "pub", set = "pub")]
    name: String,

    #[getset(get = "pub")]
    filename: String,
}

fn intbool<S>(x: &bool, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if *x {
        s.serialize_i32(1)
    } else {
        s.serialize_i32(0)
    }
}

fn to_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: de::Deserializer<'de>,
{
    match String::deserialize(deserializer)?
        .to_ascii_lowercase()
        .as_ref()
    {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(de::Error::invalid_value(
            de::Unexpected::Str(other),
            &"0/1, true/false, True/False are the only supported values",
        )),
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct Manifest {
    records: Vec<Record>,
}

impl Record {
    pub fn from_sig(sig: &Signature, path: &str) -> Vec<Self> {
        sig.iter()
            .map(|mh| {
                let md5 = mh.md5sum();
                let md5short = md5[0..8.min(md5.len())].into();

                Self {
                    internal_location: path.into(),
                    moltype: mh.hash_function().as_manifest_str().into(),
                    name: sig.name(),
                    ksize: mh.ksize(),
                    md5,
                    md5short,
                    with_abundance: mh.track_abundance(),
                    filename: sig.filename(),
                    n_hashes: mh.size(),
                    num: mh.num(),
                    scaled: mh.scaled(),
                }
            })
            .collect()
    }

    pub fn moltype(&self) -> Result<HashFunctions> {
        self.moltype.as_str().try_into()
    }

    /// Records describing the same named sketch at the same location.
    pub fn identity(&self) -> (&str, &str, &str) {
        (
            self.name.as_str(),
            self.md5.as_str(),
            self.internal_location.as_str(),
        )
    }

    pub fn check_compatible(&self, other: &Record) -> Result<()> {
        use crate::Error;

        if self.ksize() != other.ksize() {
            return Err(Error::MismatchKSizes);
        }
        if self.moltype()? != other.moltype()? {
            return Err(Error::MismatchDNAProt);
        }
        Ok(())
    }
}

impl Manifest {
    pub fn from_reader<R: Read>(rdr: R) -> Result<Self> {
        let mut records = vec![];

        let mut rdr = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_reader(rdr);
        for result in rdr.deserialize() {
            let record: Record = result?;
            records.push(record);
        }
        Ok(Manifest { records })
    }

    pub fn to_writer<W: Write>(&self, mut wtr: W) -> Result<()> {
        wtr.write_all(MANIFEST_HEADER)?;

        let mut wtr = csv::Writer::from_writer(wtr);

        for record in &self.records {
            wtr.serialize(record)?;
        }
        wtr.flush()?;

        Ok(())
    }

    pub fn internal_locations(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.internal_location.as_str())
    }

    /// Distinct internal locations, in order of first appearance.
    pub fn unique_locations(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.internal_locations()
            .filter(|loc| seen.insert(*loc))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn scaled_values(&self) -> BTreeSet<u64> {
        self.records.iter().map(|r| r.scaled).collect()
    }

    /// Keep only records whose `(md5, name)` also appears in `other`.
    pub fn intersect_manifest(&self, other: &Manifest) -> Manifest {
        let keys: HashSet<(&str, &str)> = other
            .iter()
            .map(|r| (r.md5.as_str(), r.name.as_str()))
            .collect();
        self.records
            .iter()
            .filter(|r| keys.contains(&(r.md5.as_str(), r.name.as_str())))
            .cloned()
            .collect::<Vec<_>>()
            .into()
    }

    /// Drop records already seen by `(name, md5, internal_location)`.
    pub fn dedup(self) -> Self {
        let mut seen = HashSet::new();
        let records = self
            .records
            .into_iter()
            .filter(|r| {
                let (name, md5, loc) = r.identity();
                seen.insert((name.to_string(), md5.to_string(), loc.to_string()))
            })
            .collect();
        Manifest { records }
    }
}

impl Select for Manifest {
    fn select(self, selection: &Selection) -> Result<Self> {
        let records = self
            .records
            .into_iter()
            .filter(|row| selection.matches(row))
            .collect();
        Ok(Manifest { records })
    }
}

impl From<Vec<Record>> for Manifest {
    fn from(records: Vec<Record>) -> Self {
        Manifest { records }
    }
}

impl FromIterator<Record> for Manifest {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Manifest {
            records: iter.into_iter().collect(),
        }
    }
}

impl Deref for Manifest {
    type Target = Vec<Record>;

    fn deref(&self) -> &Self::Target {
        &self.records
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;

    use tempfile::TempDir;

    use super::*;
    use crate::sketch::minhash::KmerMinHash;

    fn manifest() -> Manifest {
        let mut records = vec![];
        for (i, (k, scaled, abund)) in [(21, 100, false), (31, 1000, true), (31, 100, false)]
            .into_iter()
            .enumerate()
        {
            let mut mh = KmerMinHash::builder()
                .ksize(k)
                .max_hash(crate::sketch::minhash::max_hash_for_scaled(scaled))
                .abunds(if abund { Some(vec![]) } else { None })
                .build();
            mh.add_many(&[1, 2, i as u64 + 3]);
            let sig = Signature::builder()
                .name(format!("sig{i}"))
                .signatures(vec![mh])
                .build();
            records.extend(Record::from_sig(&sig, &format!("sig{i}.sig")));
        }
        records.into()
    }

    #[test]
    fn manifest_to_writer_bools() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("sigs.manifest.csv");
        let wtr = File::create(&filename).unwrap();
        manifest().to_writer(wtr).unwrap();

        let contents = std::fs::read_to_string(&filename).unwrap();
        assert!(contents.starts_with("# SOURMASH-MANIFEST-VERSION: 1.0\n"));

        let m2 = Manifest::from_reader(File::open(&filename).unwrap()).unwrap();
        assert_eq!(m2.len(), 3);
        let abunds: Vec<bool> = m2.iter().map(|r| *r.with_abundance()).collect();
        assert_eq!(abunds, [false, true, false]);
        assert_eq!(m2[1].moltype().unwrap(), HashFunctions::murmur64_DNA);
    }

    #[test]
    fn select_by_ksize_and_scaled() {
        let selection = Selection::builder().ksize(31).build();
        assert_eq!(manifest().select(&selection).unwrap().len(), 2);

        let selection = Selection::builder().ksize(31).scaled(500).build();
        let selected = manifest().select(&selection).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(*selected[0].scaled(), 100);

        let selection = Selection::builder().abund(true).build();
        assert_eq!(manifest().select(&selection).unwrap().len(), 1);
    }

    #[test]
    fn dedup_and_intersect() {
        let m = manifest();
        let mut doubled: Vec<Record> = m.iter().cloned().collect();
        doubled.extend(m.iter().cloned());
        let doubled = Manifest::from(doubled).dedup();
        assert_eq!(doubled.len(), 3);

        let subset: Manifest = m.iter().skip(1).cloned().collect();
        assert_eq!(m.intersect_manifest(&subset).len(), 2);
        assert_eq!(m.unique_locations(), ["sig0.sig", "sig1.sig", "sig2.sig"]);
        assert_eq!(m.scaled_values().into_iter().collect::<Vec<_>>(), [100, 1000]);
    }

    #[test]
    fn renamed_copies_are_distinct() {
        let mut mh = KmerMinHash::builder().ksize(31).build();
        mh.add_many(&[1, 2, 3]);
        let mut records = vec![];
        for name in ["first", "second"] {
            let sig = Signature::builder()
                .name(name)
                .signatures(vec![mh.clone()])
                .build();
            records.extend(Record::from_sig(&sig, "both.sig"));
        }
        let m = Manifest::from(records);
        assert_eq!(m[0].md5(), m[1].md5());
        assert_eq!(m.clone().dedup().len(), 2);

        let only_second: Manifest = m.iter().skip(1).cloned().collect();
        let kept = m.intersect_manifest(&only_second);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name(), "second");
    }
}
