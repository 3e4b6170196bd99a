use thiserror::Error;

#[derive(Debug, Error)]
pub enum BranchwaterError {
    /// Raised for internal errors in the libraries.  Should not happen.
    #[error("internal error: {message:?}")]
    Internal { message: String },

    #[error("different ksizes cannot be compared")]
    MismatchKSizes,

    #[error("DNA/prot minhashes cannot be compared")]
    MismatchDNAProt,

    #[error("mismatch in scaled; comparison fail")]
    MismatchScaled,

    #[error("mismatch in seed; comparison fail")]
    MismatchSeed,

    #[error("num sketches are not supported; only scaled sketches can be compared")]
    MismatchNum,

    #[error("Invalid hash function: {function:?}")]
    InvalidHashFunction { function: String },

    #[error("cannot downsample from scaled={from} to the smaller scaled={to}")]
    CannotUpsample { from: u64, to: u64 },

    #[error("no sketches loaded from '{path}'")]
    EmptyCollection { path: String },

    #[error("no such file or directory: '{path}'")]
    MissingPath { path: String },

    #[error("could not load sketches from '{path}': {message}")]
    LoadFailure { path: String, message: String },

    #[error("{failed} paths failed to load from '{path}'; see messages above")]
    FailedPaths { path: String, failed: usize },

    #[error("refusing to load '{path}': nested collections exceed depth {depth} or form a cycle")]
    LoadCycle { path: String, depth: usize },

    #[error("multiple scaled values in '{path}' ({values}); select a scaled or allow rescaling")]
    MultipleScaled { path: String, values: String },

    #[error("invalid picklist '{path}': {message}")]
    InvalidPickfile { path: String, message: String },

    #[error("unknown similarity column '{column}'; expected one of containment, max_containment, jaccard, average_ani, max_ani")]
    InvalidColumn { column: String },

    #[error("invalid pairwise table '{path}': {message}")]
    InvalidPairwiseTable { path: String, message: String },

    #[error("'{path}' is not a valid RevIndex database")]
    NotRevIndex { path: String },

    #[error("RevIndex at '{path}' uses an old format (missing {missing}); run upgrade first")]
    OldRevIndexFormat { path: String, missing: String },

    #[error("RevIndex at '{path}' is corrupt: {message}")]
    CorruptIndex { path: String, message: String },

    #[error("refusing to overwrite existing index at '{path}'")]
    IndexExists { path: String },

    #[error("cannot index this collection with external storage: {message}")]
    ExternalStorageUnavailable { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("data for '{path}' not found in storage")]
    DataNotFound { path: String },

    #[error("worker pool error: {message}")]
    Scheduler { message: String },

    #[error("output writer failed: {message}")]
    Output { message: String },

    #[error(transparent)]
    CsvError(#[from] csv::Error),

    #[error(transparent)]
    SerdeError(#[from] serde_json::error::Error),

    #[error(transparent)]
    NifflerError(#[from] niffler::Error),

    #[error(transparent)]
    RocksDBError(#[from] rocksdb::Error),

    #[error(transparent)]
    Utf8Error(#[from] std::str::Utf8Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}
