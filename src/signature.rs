//! # Compressed representations of genomic data
//!
//! A signature is a collection of sketches for a genomic dataset.

use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::encodings::HashFunctions;
use crate::selection::{Select, Selection};
use crate::sketch::minhash::KmerMinHash;
use crate::storage::ToWriter;
use crate::Error;

#[derive(Serialize, Deserialize, Debug, Clone, TypedBuilder)]
pub struct Signature {
    #[serde(default = "default_class")]
    #[builder(default = default_class())]
    class: String,

    #[serde(default)]
    #[builder(default)]
    email: String,

    #[serde(default = "default_hash_function")]
    #[builder(setter(into), default = default_hash_function())]
    hash_function: String,

    #[builder(default)]
    filename: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(crate) name: Option<String>,

    #[serde(default = "default_license")]
    #[builder(default = default_license())]
    license: String,

    pub(crate) signatures: Vec<KmerMinHash>,

    #[serde(default = "default_version")]
    #[builder(default = default_version())]
    version: f64,
}

fn default_license() -> String {
    "CC0".to_string()
}

fn default_class() -> String {
    "sourmash_signature".to_string()
}

fn default_hash_function() -> String {
    "0.murmur64".to_string()
}

fn default_version() -> f64 {
    0.4
}

impl Signature {
    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(filename) = &self.filename {
            filename.clone()
        } else {
            self.md5sum()
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.into())
    }

    pub fn filename(&self) -> String {
        self.filename.clone().unwrap_or_default()
    }

    pub fn set_filename(&mut self, name: &str) {
        self.filename = Some(name.into())
    }

    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KmerMinHash> {
        self.signatures.iter()
    }

    pub fn sketches(&self) -> &[KmerMinHash] {
        &self.signatures
    }

    pub fn push(&mut self, mh: KmerMinHash) {
        self.signatures.push(mh);
    }

    /// The first sketch, which after `select` is the one matching the selection.
    pub fn minhash(&self) -> Option<&KmerMinHash> {
        self.signatures.first()
    }

    pub fn md5sum(&self) -> String {
        self.minhash().map(|mh| mh.md5sum()).unwrap_or_default()
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<Signature>, Error> {
        let mut reader = io::BufReader::new(File::open(path)?);
        Signature::from_reader(&mut reader)
    }

    pub fn from_reader<R>(rdr: R) -> Result<Vec<Signature>, Error>
    where
        R: io::Read,
    {
        let (rdr, _format) = niffler::get_reader(Box::new(rdr))?;

        let sigs: Vec<Signature> = serde_json::from_reader(rdr)?;
        Ok(sigs)
    }

    /// Split every signature into one signature per sketch, keeping only
    /// sketches that match `ksize` and `moltype`.
    pub fn load_signatures<R>(
        buf: R,
        ksize: Option<u32>,
        moltype: Option<HashFunctions>,
    ) -> Result<Vec<Signature>, Error>
    where
        R: io::Read,
    {
        let orig_sigs = Signature::from_reader(buf)?;

        let flat_sigs = orig_sigs.into_iter().flat_map(|s| {
            s.signatures
                .iter()
                .filter(|mh| ksize.map_or(true, |k| mh.ksize() == k))
                .filter(|mh| moltype.map_or(true, |m| mh.hash_function() == m))
                .map(|mh| {
                    let mut new_s = s.clone();
                    new_s.signatures = vec![mh.clone()];
                    new_s
                })
                .collect::<Vec<Signature>>()
        });

        Ok(flat_sigs.collect())
    }
}

impl Select for Signature {
    fn select(mut self, selection: &Selection) -> Result<Self, Error> {
        let mut selected = Vec::with_capacity(self.signatures.len());
        for mh in self.signatures.into_iter() {
            // only scaled sketches are usable
            if mh.max_hash() == 0 {
                continue;
            }
            if let Some(ksize) = selection.ksize() {
                if mh.ksize() != ksize {
                    continue;
                }
            }
            if let Some(moltype) = selection.moltype() {
                if mh.hash_function() != moltype {
                    continue;
                }
            }
            if let Some(abund) = selection.abund() {
                if abund && !mh.track_abundance() {
                    continue;
                }
            }
            match selection.scaled() {
                Some(scaled) if mh.scaled() < scaled => {
                    selected.push(mh.downsample_scaled(scaled)?)
                }
                Some(scaled) if mh.scaled() > scaled => continue,
                _ => selected.push(mh),
            }
        }
        self.signatures = selected;
        Ok(self)
    }
}

impl ToWriter for Signature {
    fn to_writer<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: io::Write,
    {
        serde_json::to_writer(writer, &vec![&self])?;
        Ok(())
    }
}

impl Default for Signature {
    fn default() -> Signature {
        Signature {
            class: default_class(),
            email: "".to_string(),
            hash_function: default_hash_function(),
            license: default_license(),
            filename: None,
            name: None,
            signatures: Vec::new(),
            version: default_version(),
        }
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Signature) -> bool {
        self.name == other.name
            && self.filename == other.filename
            && self.signatures == other.signatures
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn sig(name: &str, ksizes: &[u32]) -> Signature {
        let signatures = ksizes
            .iter()
            .map(|&k| {
                let mut mh = KmerMinHash::new(1, k, HashFunctions::murmur64_DNA, 42);
                mh.add_many(&[1, 2, 3, k as u64 * 100]);
                mh
            })
            .collect();
        Signature::builder()
            .name(name)
            .signatures(signatures)
            .build()
    }

    #[test]
    fn name_falls_back_to_filename_then_md5() {
        let mut s = Signature::default();
        let mut mh = KmerMinHash::new(1, 21, HashFunctions::murmur64_DNA, 42);
        mh.add_hash(5);
        s.push(mh.clone());
        assert_eq!(s.name(), mh.md5sum());

        s.set_filename("reads.fa");
        assert_eq!(s.name(), "reads.fa");

        s.set_name("sample");
        assert_eq!(s.name(), "sample");
    }

    #[test]
    fn roundtrip_through_gzip() {
        let original = sig("gzipped", &[21, 31]);

        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let out = std::fs::File::create(tmp.path()).unwrap();
            let mut wtr = niffler::get_writer(
                Box::new(out),
                niffler::compression::Format::Gzip,
                niffler::compression::Level::One,
            )
            .unwrap();
            original.to_writer(&mut wtr).unwrap();
            wtr.flush().unwrap();
        }

        let sigs = Signature::from_path(tmp.path()).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0], original);
    }

    #[test]
    fn load_signatures_flattens_and_filters() {
        let mut buf = vec![];
        sig("multi", &[21, 31, 51]).to_writer(&mut buf).unwrap();

        let sigs = Signature::load_signatures(&buf[..], Some(31), None).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].minhash().unwrap().ksize(), 31);

        let sigs = Signature::load_signatures(&buf[..], None, None).unwrap();
        assert_eq!(sigs.len(), 3);
    }

    #[test]
    fn select_downsamples_and_drops() {
        let mut low = KmerMinHash::new(10, 31, HashFunctions::murmur64_DNA, 42);
        low.add_many(&[1, 2, 3]);
        let high = KmerMinHash::new(10000, 31, HashFunctions::murmur64_DNA, 42);
        let s = Signature::builder()
            .name("s")
            .signatures(vec![low, high])
            .build();

        let selection = Selection::builder().ksize(31).scaled(1000).build();
        let selected = s.select(&selection).unwrap();
        assert_eq!(selected.size(), 1);
        assert_eq!(selected.minhash().unwrap().scaled(), 1000);
    }
}
