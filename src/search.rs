//! Containment, Jaccard and ANI between sketches.
//!
//! Rows are emitted as one sorted batch per query sketch, so output is
//! grouped by query whatever the order tasks finish in.

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{info, trace, warn};
use rayon::prelude::*;
use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::ani_utils::{ani_from_containment, AniEstimator};
use crate::collection::SmallSignature;
use crate::index::revindex::RevIndex;
use crate::multicollection::MultiCollection;
use crate::output::{ResultSink, ResultType};
use crate::scheduler::Scheduler;
use crate::sketch::minhash::KmerMinHash;
use crate::{Error, Result};

/// Similarity used for thresholds and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimilarityColumn {
    #[default]
    Containment,
    MaxContainment,
    Jaccard,
    AverageAni,
    MaxAni,
}

impl SimilarityColumn {
    pub fn is_ani(&self) -> bool {
        matches!(self, Self::AverageAni | Self::MaxAni)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Containment => "containment",
            Self::MaxContainment => "max_containment",
            Self::Jaccard => "jaccard",
            Self::AverageAni => "average_ani",
            Self::MaxAni => "max_ani",
        }
    }
}

impl std::fmt::Display for SimilarityColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SimilarityColumn {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_lowercase().as_ref() {
            "containment" => Ok(Self::Containment),
            "max_containment" => Ok(Self::MaxContainment),
            "jaccard" => Ok(Self::Jaccard),
            "average_ani" => Ok(Self::AverageAni),
            "max_ani" => Ok(Self::MaxAni),
            _ => Err(Error::InvalidColumn {
                column: value.into(),
            }),
        }
    }
}

#[derive(TypedBuilder, Debug, Clone, Copy)]
pub struct SearchParams {
    /// Rows with `column` below this value are dropped; the bound is
    /// inclusive.
    #[builder(default = 0.01)]
    pub threshold: f64,

    #[builder(default)]
    pub column: SimilarityColumn,

    /// Fill the ANI columns. Always on when `column` is an ANI column.
    #[builder(default = false)]
    pub estimate_ani: bool,

    #[builder(default = ani_from_containment as AniEstimator)]
    pub ani_estimator: AniEstimator,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SearchParams {
    fn wants_ani(&self) -> bool {
        self.estimate_ani || self.column.is_ani()
    }
}

/// One compared pair of sketches.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub query_name: String,
    pub query_md5: String,
    pub match_name: String,
    pub match_md5: String,
    /// fraction of the query found in the match
    pub containment: f64,
    /// fraction of the match found in the query
    pub match_containment: f64,
    pub max_containment: f64,
    pub jaccard: f64,
    pub intersect_hashes: usize,
    pub intersect_bp: u64,
    pub query_ani: Option<f64>,
    pub match_ani: Option<f64>,
    pub average_ani: Option<f64>,
    pub max_ani: Option<f64>,
}

impl ResultType for SearchResult {
    fn header_fields() -> &'static [&'static str] {
        &[
            "query_name",
            "query_md5",
            "match_name",
            "match_md5",
            "containment",
            "match_containment",
            "max_containment",
            "jaccard",
            "intersect_hashes",
            "intersect_bp",
            "query_ani",
            "match_ani",
            "average_ani",
            "max_ani",
        ]
    }
}

/// Sizes a result is computed from.
struct Overlap {
    intersect: usize,
    query_size: usize,
    match_size: usize,
    ksize: u32,
    scaled: u64,
}

fn fraction(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

impl SearchResult {
    fn from_overlap(
        query: &SmallSignature,
        match_name: &str,
        match_md5: &str,
        counts: &Overlap,
        params: &SearchParams,
    ) -> Self {
        let containment = fraction(counts.intersect, counts.query_size);
        let match_containment = fraction(counts.intersect, counts.match_size);
        let max_containment = containment.max(match_containment);
        let jaccard = fraction(
            counts.intersect,
            counts.query_size + counts.match_size - counts.intersect,
        );

        let (query_ani, match_ani, average_ani, max_ani) = if params.wants_ani() {
            let ksize = counts.ksize as f64;
            let estimate = params.ani_estimator;
            let query_ani = estimate(containment, ksize);
            let match_ani = estimate(match_containment, ksize);
            (
                Some(query_ani),
                Some(match_ani),
                Some((query_ani + match_ani) / 2.0),
                Some(estimate(max_containment, ksize)),
            )
        } else {
            (None, None, None, None)
        };

        Self {
            query_name: query.name.clone(),
            query_md5: query.md5sum.clone(),
            match_name: match_name.into(),
            match_md5: match_md5.into(),
            containment,
            match_containment,
            max_containment,
            jaccard,
            intersect_hashes: counts.intersect,
            intersect_bp: counts.intersect as u64 * counts.scaled,
            query_ani,
            match_ani,
            average_ani,
            max_ani,
        }
    }

    /// Value of `column` for this row; ANI columns are zero when not
    /// estimated.
    pub fn value(&self, column: SimilarityColumn) -> f64 {
        match column {
            SimilarityColumn::Containment => self.containment,
            SimilarityColumn::MaxContainment => self.max_containment,
            SimilarityColumn::Jaccard => self.jaccard,
            SimilarityColumn::AverageAni => self.average_ani.unwrap_or(0.0),
            SimilarityColumn::MaxAni => self.max_ani.unwrap_or(0.0),
        }
    }

    fn passes(&self, params: &SearchParams) -> bool {
        self.value(params.column) >= params.threshold
    }
}

/// Order rows by `column` descending, then match name and md5.
pub fn sort_results(results: &mut [SearchResult], column: SimilarityColumn) {
    results.sort_by(|a, b| {
        b.value(column)
            .total_cmp(&a.value(column))
            .then_with(|| a.match_name.cmp(&b.match_name))
            .then_with(|| a.match_md5.cmp(&b.match_md5))
    });
}

/// Bring two sketches to the coarser of their scaled values.
fn at_common_scaled<'a>(
    a: &'a KmerMinHash,
    b: &'a KmerMinHash,
) -> Result<(Cow<'a, KmerMinHash>, Cow<'a, KmerMinHash>)> {
    match a.max_hash().cmp(&b.max_hash()) {
        CmpOrdering::Equal => Ok((Cow::Borrowed(a), Cow::Borrowed(b))),
        CmpOrdering::Greater => Ok((
            Cow::Owned(a.downsample_max_hash(b.max_hash())?),
            Cow::Borrowed(b),
        )),
        CmpOrdering::Less => Ok((
            Cow::Borrowed(a),
            Cow::Owned(b.downsample_max_hash(a.max_hash())?),
        )),
    }
}

/// Compare two sketches.
///
/// Returns `None` when they share no hashes or when the selected column is
/// below the threshold. Incompatible sketches are an error.
pub fn compare(
    query: &SmallSignature,
    against: &SmallSignature,
    params: &SearchParams,
) -> Result<Option<SearchResult>> {
    let (q, m) = at_common_scaled(&query.minhash, &against.minhash)?;
    let intersect = q.count_common(&m, false)? as usize;
    if intersect == 0 {
        return Ok(None);
    }

    let counts = Overlap {
        intersect,
        query_size: q.size(),
        match_size: m.size(),
        ksize: q.ksize(),
        scaled: q.scaled(),
    };
    let result = SearchResult::from_overlap(query, &against.name, &against.md5sum, &counts, params);
    Ok(if result.passes(params) {
        Some(result)
    } else {
        None
    })
}

/// Outcome counts of a search run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStats {
    /// sketches searched
    pub processed: usize,
    /// comparisons skipped because the sketches were incompatible
    pub skipped: usize,
    /// sketches that failed to load
    pub failed: usize,
    /// rows emitted
    pub rows: usize,
}

#[derive(Default)]
struct StatsCounter {
    processed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    rows: AtomicUsize,
}

impl StatsCounter {
    fn compare(
        &self,
        query: &SmallSignature,
        against: &SmallSignature,
        params: &SearchParams,
    ) -> Option<SearchResult> {
        match compare(query, against, params) {
            Ok(result) => result,
            Err(e) => {
                trace!("cannot compare '{}' to '{}': {}", query.name, against.name, e);
                self.skipped.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    fn emit<S: ResultSink<SearchResult>>(
        &self,
        sink: &S,
        mut results: Vec<SearchResult>,
        column: SimilarityColumn,
    ) -> Result<()> {
        let i = self.processed.fetch_add(1, Ordering::SeqCst);
        if i % 1000 == 0 && i > 0 {
            info!("Processed {} search sigs", i);
        }
        if results.is_empty() {
            return Ok(());
        }
        sort_results(&mut results, column);
        self.rows.fetch_add(results.len(), Ordering::SeqCst);
        sink.emit(results)
    }

    fn finish(self, what: &str) -> SearchStats {
        let stats = SearchStats {
            processed: self.processed.into_inner(),
            skipped: self.skipped.into_inner(),
            failed: self.failed.into_inner(),
            rows: self.rows.into_inner(),
        };
        info!(
            "{}: searched {} sketches, {} results",
            what, stats.processed, stats.rows
        );
        if stats.skipped > 0 {
            warn!(
                "{}: skipped {} comparisons between incompatible sketches",
                what, stats.skipped
            );
        }
        if stats.failed > 0 {
            warn!("{}: {} sketches failed to load", what, stats.failed);
        }
        stats
    }
}

/// Compare every unique pair within `sketches`.
///
/// Pairs `(i, j)` with `i < j` are compared, plus `(i, i)` when
/// `include_self` is set.
pub fn pairwise<S: ResultSink<SearchResult>>(
    sketches: &[SmallSignature],
    params: &SearchParams,
    include_self: bool,
    scheduler: &Scheduler,
    sink: &S,
) -> Result<SearchStats> {
    let stats = StatsCounter::default();

    scheduler.install(|| {
        sketches.par_iter().enumerate().try_for_each(|(i, query)| {
            let start = if include_self { i } else { i + 1 };
            let results = sketches[start..]
                .iter()
                .filter_map(|against| stats.compare(query, against, params))
                .collect();
            stats.emit(sink, results, params.column)
        })
    })??;

    Ok(stats.finish("pairwise"))
}

/// Compare every query against every reference.
///
/// A pair is skipped only when both sides have the same md5 and name.
pub fn multisearch<S: ResultSink<SearchResult>>(
    queries: &[SmallSignature],
    against: &[SmallSignature],
    params: &SearchParams,
    scheduler: &Scheduler,
    sink: &S,
) -> Result<SearchStats> {
    let stats = StatsCounter::default();

    scheduler.install(|| {
        queries.par_iter().try_for_each(|query| {
            let results = against
                .iter()
                .filter(|a| !(a.md5sum == query.md5sum && a.name == query.name))
                .filter_map(|a| stats.compare(query, a, params))
                .collect();
            stats.emit(sink, results, params.column)
        })
    })??;

    Ok(stats.finish("multisearch"))
}

/// Compare in-memory queries against references loaded one at a time.
///
/// References are streamed from `against` in parallel; rows are merged
/// per query at the end and emitted in query order.
pub fn manysearch<S: ResultSink<SearchResult>>(
    queries: &[SmallSignature],
    against: &MultiCollection,
    params: &SearchParams,
    scheduler: &Scheduler,
    sink: &S,
) -> Result<SearchStats> {
    let stats = StatsCounter::default();
    let processed_refs = AtomicUsize::new(0);

    let found: Vec<(usize, SearchResult)> = scheduler.install(|| {
        against
            .par_iter()
            .flat_map_iter(|(coll, _idx, record)| {
                let i = processed_refs.fetch_add(1, Ordering::SeqCst);
                if i % 1000 == 0 && i > 0 {
                    info!("Processed {} reference sigs", i);
                }

                let reference = match coll.small_sig_from_record(record) {
                    Ok(sig) => Some(sig),
                    Err(e) => {
                        warn!(
                            "FAILED to load sketch from '{}': {}",
                            record.internal_location(),
                            e
                        );
                        stats.failed.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                };

                let stats = &stats;
                reference.into_iter().flat_map(move |reference| {
                    queries
                        .iter()
                        .enumerate()
                        .filter_map(|(qi, query)| {
                            stats.compare(query, &reference, params).map(|r| (qi, r))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect()
    })?;

    let mut by_query: Vec<Vec<SearchResult>> = vec![vec![]; queries.len()];
    for (qi, result) in found {
        by_query[qi].push(result);
    }
    for results in by_query {
        stats.emit(sink, results, params.column)?;
    }

    Ok(stats.finish("manysearch"))
}

/// Compare queries against a RevIndex using only its inverted table.
///
/// Match sizes come from the index manifest.
pub fn manysearch_rocksdb<S: ResultSink<SearchResult>>(
    queries: &[SmallSignature],
    index: &RevIndex,
    params: &SearchParams,
    scheduler: &Scheduler,
    sink: &S,
) -> Result<SearchStats> {
    let stats = StatsCounter::default();

    scheduler.install(|| {
        queries.par_iter().try_for_each(|query| {
            let query_mh = match index.prepare_query(&query.minhash) {
                Ok(mh) => mh,
                Err(e) => {
                    warn!("skipping query '{}': {}", query.name, e);
                    stats.skipped.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            };

            let counter = index.counter_for_query(&query_mh)?;
            let results = index
                .matches_from_counter(&counter, 1)?
                .into_iter()
                .map(|(record, overlap)| {
                    let counts = Overlap {
                        intersect: overlap,
                        query_size: query_mh.size(),
                        match_size: *record.n_hashes(),
                        ksize: query_mh.ksize(),
                        scaled: query_mh.scaled(),
                    };
                    SearchResult::from_overlap(query, record.name(), record.md5(), &counts, params)
                })
                .filter(|r| r.passes(params))
                .collect();
            stats.emit(sink, results, params.column)
        })
    })??;

    Ok(stats.finish("manysearch"))
}
