//! # Fast, multithreaded search over FracMinHash sketch collections
//!
//! branchwater compares sketches of genomic and metagenomic datasets at
//! scale. It loads collections of signatures from files, zip archives,
//! manifests and pathlists, and then:
//!
//! - searches many queries against many references, reporting containment,
//!   Jaccard similarity and ANI estimates ([`search`]),
//! - decomposes queries into their best-covering references with the greedy
//!   min-set-cov `gather` algorithm ([`gather`]),
//! - builds and queries an on-disk reverse index backed by RocksDB
//!   ([`index::revindex`]),
//! - clusters pairwise similarity tables into connected components
//!   ([`cluster`]).
//!
//! The [`cmd`] module ties everything together into end-to-end commands
//! that write CSV output.

pub mod errors;
pub use errors::BranchwaterError as Error;

pub type Result<T> = std::result::Result<T, Error>;

pub mod ani_utils;
pub mod cluster;
pub mod cmd;
pub mod collection;
pub mod encodings;
pub mod gather;
pub mod index;
pub mod manifest;
pub mod multicollection;
pub mod output;
pub mod picklist;
pub mod prelude;
pub mod scheduler;
pub mod search;
pub mod selection;
pub mod signature;
pub mod sketch;
pub mod storage;

type HashIntoType = u64;
