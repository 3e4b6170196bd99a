use std::cmp::Ordering;
use std::fmt::Write;
use std::iter::{Iterator, Peekable};
use std::sync::Mutex;

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::encodings::HashFunctions;
use crate::Error;
use crate::HashIntoType;

pub fn max_hash_for_scaled(scaled: u64) -> u64 {
    match scaled {
        0 => 0,
        1 => u64::max_value(),
        _ => (u64::max_value() as f64 / scaled as f64) as u64,
    }
}

pub fn scaled_for_max_hash(max_hash: u64) -> u64 {
    match max_hash {
        0 => 0,
        _ => (u64::max_value() as f64 / max_hash as f64).round() as u64,
    }
}

#[derive(Debug, TypedBuilder)]
pub struct KmerMinHash {
    #[builder(default = 0)]
    num: u32,

    ksize: u32,

    #[builder(setter(into), default = HashFunctions::murmur64_DNA)]
    hash_function: HashFunctions,

    #[builder(default = 42u64)]
    seed: u64,

    #[builder(default = u64::max_value())]
    max_hash: u64,

    #[builder(default)]
    mins: Vec<u64>,

    #[builder(default)]
    abunds: Option<Vec<u64>>,

    #[builder(default)]
    md5sum: Mutex<Option<String>>,
}

impl PartialEq for KmerMinHash {
    fn eq(&self, other: &KmerMinHash) -> bool {
        self.md5sum() == other.md5sum()
            && self.hash_function == other.hash_function
            && self.max_hash == other.max_hash
    }
}

impl Clone for KmerMinHash {
    fn clone(&self) -> Self {
        KmerMinHash {
            num: self.num,
            ksize: self.ksize,
            hash_function: self.hash_function,
            seed: self.seed,
            max_hash: self.max_hash,
            mins: self.mins.clone(),
            abunds: self.abunds.clone(),
            md5sum: Mutex::new(Some(self.md5sum())),
        }
    }
}

impl Serialize for KmerMinHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let n_fields = match &self.abunds {
            Some(_) => 8,
            _ => 7,
        };

        let mut partial = serializer.serialize_struct("KmerMinHash", n_fields)?;
        partial.serialize_field("num", &self.num)?;
        partial.serialize_field("ksize", &self.ksize)?;
        partial.serialize_field("seed", &self.seed)?;
        partial.serialize_field("max_hash", &self.max_hash)?;
        partial.serialize_field("mins", &self.mins)?;
        partial.serialize_field("md5sum", &self.md5sum())?;

        if let Some(abunds) = &self.abunds {
            partial.serialize_field("abundances", abunds)?;
        }

        partial.serialize_field("molecule", self.hash_function.as_manifest_str())?;

        partial.end()
    }
}

impl<'de> Deserialize<'de> for KmerMinHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TempSig {
            num: u32,
            ksize: u32,
            seed: u64,
            max_hash: u64,
            md5sum: Option<String>,
            mins: Vec<u64>,
            abundances: Option<Vec<u64>>,
            molecule: String,
        }

        let tmpsig = TempSig::deserialize(deserializer)?;

        let num = if tmpsig.max_hash != 0 { 0 } else { tmpsig.num };
        let hash_function = HashFunctions::try_from(tmpsig.molecule.as_str())
            .map_err(serde::de::Error::custom)?;

        // older signatures may carry unordered mins
        let (mins, abunds) = if let Some(abunds) = tmpsig.abundances {
            let mut values: Vec<(_, _)> = tmpsig.mins.into_iter().zip(abunds).collect();
            values.sort_unstable();
            values.dedup_by_key(|(h, _)| *h);
            let (mins, abunds) = values.into_iter().unzip();
            (mins, Some(abunds))
        } else {
            let mut values = tmpsig.mins;
            values.sort_unstable();
            values.dedup();
            (values, None)
        };

        Ok(KmerMinHash {
            num,
            ksize: tmpsig.ksize,
            seed: tmpsig.seed,
            max_hash: tmpsig.max_hash,
            md5sum: Mutex::new(tmpsig.md5sum),
            mins,
            abunds,
            hash_function,
        })
    }
}

impl KmerMinHash {
    pub fn new(scaled: u64, ksize: u32, hash_function: HashFunctions, seed: u64) -> KmerMinHash {
        KmerMinHash {
            num: 0,
            ksize,
            hash_function,
            seed,
            max_hash: max_hash_for_scaled(scaled),
            mins: Vec::with_capacity(1000),
            abunds: None,
            md5sum: Mutex::new(None),
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn ksize(&self) -> u32 {
        self.ksize
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn hash_function(&self) -> HashFunctions {
        self.hash_function
    }

    pub fn max_hash(&self) -> u64 {
        self.max_hash
    }

    pub fn scaled(&self) -> u64 {
        scaled_for_max_hash(self.max_hash)
    }

    pub fn track_abundance(&self) -> bool {
        self.abunds.is_some()
    }

    pub fn size(&self) -> usize {
        self.mins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mins.is_empty()
    }

    pub fn mins(&self) -> &[u64] {
        &self.mins
    }

    pub fn iter_mins(&self) -> impl Iterator<Item = &u64> {
        self.mins.iter()
    }

    fn reset_md5sum(&self) {
        if let Ok(mut data) = self.md5sum.lock() {
            *data = None;
        }
    }

    pub fn md5sum(&self) -> String {
        let mut data = match self.md5sum.lock() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        if data.is_none() {
            let mut buffer = String::with_capacity(20);

            let mut md5_ctx = md5::Context::new();
            let _ = write!(&mut buffer, "{}", self.ksize);
            md5_ctx.consume(&buffer);
            buffer.clear();
            for x in &self.mins {
                let _ = write!(&mut buffer, "{}", x);
                md5_ctx.consume(&buffer);
                buffer.clear();
            }
            *data = Some(format!("{:x}", md5_ctx.compute()));
        }
        data.clone().unwrap_or_default()
    }

    pub fn add_hash(&mut self, hash: HashIntoType) {
        if self.max_hash != 0 && hash > self.max_hash {
            return;
        }
        if let Err(pos) = self.mins.binary_search(&hash) {
            self.mins.insert(pos, hash);
            if let Some(ref mut abunds) = self.abunds {
                abunds.insert(pos, 1);
            }
            self.reset_md5sum();
        }
    }

    pub fn add_many(&mut self, hashes: &[HashIntoType]) {
        let max_hash = self.max_hash;
        self.mins.extend(
            hashes
                .iter()
                .filter(|&&h| max_hash == 0 || h <= max_hash)
                .copied(),
        );
        self.mins.sort_unstable();
        self.mins.dedup();
        if self.abunds.is_some() {
            self.abunds = Some(vec![1; self.mins.len()]);
        }
        self.reset_md5sum();
    }

    /// Remove every hash in `hashes` from this sketch.
    pub fn remove_many(&mut self, hashes: &[HashIntoType]) {
        let mut to_remove = hashes.to_vec();
        to_remove.sort_unstable();

        let keep: Vec<bool> = self
            .mins
            .iter()
            .map(|h| to_remove.binary_search(h).is_err())
            .collect();

        if let Some(ref mut abunds) = self.abunds {
            let mut it = keep.iter();
            abunds.retain(|_| *it.next().unwrap_or(&true));
        }
        let mut it = keep.iter();
        self.mins.retain(|_| *it.next().unwrap_or(&true));
        self.reset_md5sum();
    }

    pub fn remove_from(&mut self, other: &KmerMinHash) -> Result<(), Error> {
        self.check_compatible(other)?;
        self.remove_many(&other.mins);
        Ok(())
    }

    pub fn check_compatible(&self, other: &KmerMinHash) -> Result<(), Error> {
        if self.ksize != other.ksize {
            return Err(Error::MismatchKSizes);
        }
        if self.hash_function != other.hash_function {
            return Err(Error::MismatchDNAProt);
        }
        if self.max_hash != other.max_hash {
            return Err(Error::MismatchScaled);
        }
        if self.seed != other.seed {
            return Err(Error::MismatchSeed);
        }
        Ok(())
    }

    /// Number of hashes shared with `other`.
    ///
    /// With `downsample`, the sketch with the smaller scaled is downsampled
    /// to the larger one before counting.
    pub fn count_common(&self, other: &KmerMinHash, downsample: bool) -> Result<u64, Error> {
        if downsample && self.max_hash != other.max_hash {
            let (first, second) = if self.max_hash < other.max_hash {
                (self, other)
            } else {
                (other, self)
            };
            let downsampled_mh = second.downsample_max_hash(first.max_hash)?;
            first.count_common(&downsampled_mh, false)
        } else {
            self.check_compatible(other)?;
            let iter = if self.size() < other.size() {
                Intersection::new(self.mins.iter(), other.mins.iter())
            } else {
                Intersection::new(other.mins.iter(), self.mins.iter())
            };

            Ok(iter.count() as u64)
        }
    }

    /// Hashes shared with `other`, in sorted order.
    pub fn intersection(&self, other: &KmerMinHash) -> Result<Vec<u64>, Error> {
        self.check_compatible(other)?;
        Ok(Intersection::new(self.mins.iter(), other.mins.iter())
            .copied()
            .collect())
    }

    /// Returns `(intersection, union)` sizes.
    pub fn intersection_size(&self, other: &KmerMinHash) -> Result<(u64, u64), Error> {
        let common = self.count_common(other, false)?;
        let union = (self.size() + other.size()) as u64 - common;
        Ok((common, union))
    }

    // calculate Jaccard similarity, ignoring abundance.
    pub fn jaccard(&self, other: &KmerMinHash) -> Result<f64, Error> {
        let (common, size) = self.intersection_size(other)?;
        Ok(common as f64 / u64::max(1, size) as f64)
    }

    pub fn downsample_max_hash(&self, max_hash: u64) -> Result<KmerMinHash, Error> {
        if self.max_hash != 0 && max_hash > self.max_hash {
            return Err(Error::CannotUpsample {
                from: self.scaled(),
                to: scaled_for_max_hash(max_hash),
            });
        }

        let mins: Vec<u64> = self
            .mins
            .iter()
            .take_while(|&&h| h <= max_hash)
            .copied()
            .collect();
        let abunds = self
            .abunds
            .as_ref()
            .map(|a| a.iter().take(mins.len()).copied().collect());

        Ok(KmerMinHash {
            num: self.num,
            ksize: self.ksize,
            hash_function: self.hash_function,
            seed: self.seed,
            max_hash,
            mins,
            abunds,
            md5sum: Mutex::new(None),
        })
    }

    pub fn downsample_scaled(&self, scaled: u64) -> Result<KmerMinHash, Error> {
        if self.scaled() == scaled {
            return Ok(self.clone());
        }
        self.downsample_max_hash(max_hash_for_scaled(scaled))
    }
}

struct Intersection<T, I: Iterator<Item = T>> {
    iter: Peekable<I>,
    other: Peekable<I>,
}

impl<T, I: Iterator<Item = T>> Intersection<T, I> {
    pub fn new(left: I, right: I) -> Self {
        Intersection {
            iter: left.peekable(),
            other: right.peekable(),
        }
    }
}

impl<T: Ord, I: Iterator<Item = T>> Iterator for Intersection<T, I> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let res = match (self.iter.peek(), self.other.peek()) {
                (Some(ref left_key), Some(ref right_key)) => left_key.cmp(right_key),
                _ => return None,
            };

            match res {
                Ordering::Less => {
                    self.iter.next();
                }
                Ordering::Greater => {
                    self.other.next();
                }
                Ordering::Equal => {
                    self.other.next();
                    return self.iter.next();
                }
            }
        }
    }
}
