use std::convert::TryFrom;
use std::str;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Position of a dataset inside a collection manifest.
pub type Idx = u32;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum HashFunctions {
    murmur64_DNA = 1,
    murmur64_protein = 2,
    murmur64_dayhoff = 3,
    murmur64_hp = 4,
    murmur64_skipm1n3 = 5,
    murmur64_skipm2n3 = 6,
}

impl HashFunctions {
    pub fn dna(&self) -> bool {
        *self == HashFunctions::murmur64_DNA
    }

    pub fn protein(&self) -> bool {
        *self == HashFunctions::murmur64_protein
    }

    pub fn dayhoff(&self) -> bool {
        *self == HashFunctions::murmur64_dayhoff
    }

    pub fn hp(&self) -> bool {
        *self == HashFunctions::murmur64_hp
    }

    /// Skipmer variants are computed over nucleotides.
    pub fn skipmer(&self) -> bool {
        matches!(
            self,
            HashFunctions::murmur64_skipm1n3 | HashFunctions::murmur64_skipm2n3
        )
    }

    /// Name used in manifests and signature files.
    pub fn as_manifest_str(&self) -> &'static str {
        match self {
            HashFunctions::murmur64_DNA => "DNA",
            HashFunctions::murmur64_protein => "protein",
            HashFunctions::murmur64_dayhoff => "dayhoff",
            HashFunctions::murmur64_hp => "hp",
            HashFunctions::murmur64_skipm1n3 => "skipm1n3",
            HashFunctions::murmur64_skipm2n3 => "skipm2n3",
        }
    }
}

impl std::fmt::Display for HashFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                HashFunctions::murmur64_DNA => "dna",
                HashFunctions::murmur64_protein => "protein",
                HashFunctions::murmur64_dayhoff => "dayhoff",
                HashFunctions::murmur64_hp => "hp",
                HashFunctions::murmur64_skipm1n3 => "skipm1n3",
                HashFunctions::murmur64_skipm2n3 => "skipm2n3",
            }
        )
    }
}

impl TryFrom<&str> for HashFunctions {
    type Error = Error;

    fn try_from(moltype: &str) -> Result<Self, Self::Error> {
        match moltype.to_lowercase().as_ref() {
            "dna" => Ok(HashFunctions::murmur64_DNA),
            "dayhoff" => Ok(HashFunctions::murmur64_dayhoff),
            "hp" => Ok(HashFunctions::murmur64_hp),
            "protein" => Ok(HashFunctions::murmur64_protein),
            "skipm1n3" => Ok(HashFunctions::murmur64_skipm1n3),
            "skipm2n3" => Ok(HashFunctions::murmur64_skipm2n3),
            _ => Err(Error::InvalidHashFunction {
                function: moltype.into(),
            }),
        }
    }
}
