pub use crate::collection::{Collection, CollectionSet, SmallSignature};
pub use crate::gather::{GatherParams, GatherResult};
pub use crate::index::revindex::RevIndex;
pub use crate::manifest::{Manifest, Record};
pub use crate::multicollection::MultiCollection;
pub use crate::output::{ResultSink, ResultType};
pub use crate::scheduler::Scheduler;
pub use crate::search::{SearchParams, SearchResult, SimilarityColumn};
pub use crate::selection::{Select, Selection};
pub use crate::signature::Signature;
pub use crate::sketch::minhash::KmerMinHash;
pub use crate::storage::{Storage, ToWriter};
