//! # Indexing structures for fast containment search
//!
//! The only index shipped here is the disk-based [`revindex::RevIndex`],
//! an inverted index from hashes to the datasets containing them.

pub mod revindex;

use crate::encodings::Idx;

/// Number of query hashes shared with each dataset.
pub type SigCounter = counter::Counter<Idx>;
