//! Greedy min-set-cov ("gather") of query sketches against references.
//!
//! A gather runs in two phases. Prefetch keeps the references sharing at
//! least `threshold_hashes` with the query. Gather then repeatedly picks
//! the candidate covering most of what is left of the query, removes the
//! covered hashes from the residual query and recomputes the overlaps of
//! the remaining candidates.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};

use getset::{CopyGetters, Getters};
use log::{debug, info, trace, warn};
use rayon::prelude::*;
use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::collection::SmallSignature;
use crate::index::revindex::RevIndex;
use crate::output::{ResultSink, ResultType};
use crate::scheduler::Scheduler;
use crate::sketch::minhash::KmerMinHash;
use crate::{Error, Result};

#[derive(TypedBuilder, Debug, Clone, Copy)]
pub struct GatherParams {
    /// Minimum estimated overlap, in base pairs, for a match to be reported.
    #[builder(default = 50_000)]
    pub threshold_bp: u64,
}

impl Default for GatherParams {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatherParams {
    /// Overlap threshold in hashes for sketches at `scaled`; never below one.
    pub fn threshold_hashes(&self, scaled: u64) -> usize {
        threshold_hashes(self.threshold_bp, scaled)
    }
}

pub fn threshold_hashes(threshold_bp: u64, scaled: u64) -> usize {
    let hashes = if scaled == 0 { 0 } else { threshold_bp / scaled };
    hashes.max(1) as usize
}

/// One rank of a gather decomposition.
#[derive(TypedBuilder, CopyGetters, Getters, Serialize, Debug, Clone, PartialEq)]
pub struct GatherResult {
    #[getset(get = "pub")]
    #[builder(setter(into))]
    query_file: String,

    #[getset(get_copy = "pub")]
    rank: usize,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    query_name: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    query_md5: String,

    #[serde(rename = "match")]
    #[getset(get = "pub")]
    #[builder(setter(into))]
    match_name: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    match_md5sum: String,

    /// hashes newly covered at this rank
    #[getset(get_copy = "pub")]
    overlap: usize,

    #[getset(get_copy = "pub")]
    intersect_bp: u64,

    #[getset(get_copy = "pub")]
    unique_intersect_bp: u64,

    #[getset(get_copy = "pub")]
    remaining_bp: u64,

    #[getset(get_copy = "pub")]
    f_match: f64,

    #[getset(get_copy = "pub")]
    f_orig_query: f64,

    #[getset(get_copy = "pub")]
    f_unique_to_query: f64,
}

impl ResultType for GatherResult {
    fn header_fields() -> &'static [&'static str] {
        &[
            "query_file",
            "rank",
            "query_name",
            "query_md5",
            "match",
            "match_md5sum",
            "overlap",
            "intersect_bp",
            "unique_intersect_bp",
            "remaining_bp",
            "f_match",
            "f_orig_query",
            "f_unique_to_query",
        ]
    }
}

/// Counts behind one gather rank.
pub(crate) struct RankOverlap {
    pub rank: usize,
    /// hashes shared with the residual query
    pub overlap: usize,
    /// hashes shared with the original query
    pub orig_overlap: usize,
    pub match_size: usize,
    /// residual query size after this rank
    pub remaining_hashes: usize,
}

fn fraction(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

impl GatherResult {
    pub(crate) fn from_rank(
        query: &SmallSignature,
        match_name: &str,
        match_md5: &str,
        counts: &RankOverlap,
    ) -> Self {
        let scaled = query.minhash.scaled();
        let query_size = query.minhash.size();

        GatherResult::builder()
            .query_file(query.location.as_str())
            .rank(counts.rank)
            .query_name(query.name.as_str())
            .query_md5(query.md5sum.as_str())
            .match_name(match_name)
            .match_md5sum(match_md5)
            .overlap(counts.overlap)
            .intersect_bp(counts.orig_overlap as u64 * scaled)
            .unique_intersect_bp(counts.overlap as u64 * scaled)
            .remaining_bp(counts.remaining_hashes as u64 * scaled)
            .f_match(fraction(counts.overlap, counts.match_size))
            .f_orig_query(fraction(counts.orig_overlap, query_size))
            .f_unique_to_query(fraction(counts.overlap, query_size))
            .build()
    }
}

/// Ordering of gather candidates; the greatest key wins a rank.
///
/// Larger remaining overlap first, then larger original overlap, then the
/// lexicographically smaller name and md5.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CandidateKey<'a> {
    overlap: usize,
    orig_overlap: usize,
    name: Reverse<&'a str>,
    md5: Reverse<&'a str>,
}

impl<'a> CandidateKey<'a> {
    pub(crate) fn new(overlap: usize, orig_overlap: usize, name: &'a str, md5: &'a str) -> Self {
        Self {
            overlap,
            orig_overlap,
            name: Reverse(name),
            md5: Reverse(md5),
        }
    }
}

/// A reference that passed prefetch.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub md5sum: String,
    pub minhash: KmerMinHash,
    /// overlap with the original query
    pub orig_overlap: usize,
    /// overlap with the current residual query
    pub overlap: usize,
}

impl Candidate {
    fn key(&self) -> CandidateKey<'_> {
        CandidateKey::new(self.overlap, self.orig_overlap, &self.name, &self.md5sum)
    }
}

/// A prefetch match, as written to CSV.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PrefetchResult {
    pub query_file: String,
    pub query_name: String,
    pub query_md5: String,
    #[serde(rename = "match")]
    pub match_name: String,
    pub match_md5sum: String,
    pub overlap: usize,
    pub intersect_bp: u64,
}

impl ResultType for PrefetchResult {
    fn header_fields() -> &'static [&'static str] {
        &[
            "query_file",
            "query_name",
            "query_md5",
            "match",
            "match_md5sum",
            "overlap",
            "intersect_bp",
        ]
    }
}

impl PrefetchResult {
    fn new(query: &SmallSignature, candidate: &Candidate) -> Self {
        Self {
            query_file: query.location.clone(),
            query_name: query.name.clone(),
            query_md5: query.md5sum.clone(),
            match_name: candidate.name.clone(),
            match_md5sum: candidate.md5sum.clone(),
            overlap: candidate.orig_overlap,
            intersect_bp: candidate.orig_overlap as u64 * query.minhash.scaled(),
        }
    }
}

/// Bring `query` to the parameters of `template`.
///
/// Queries with a smaller scaled are downsampled; anything else that
/// differs makes the query incomparable.
pub fn prepare_query(query: &KmerMinHash, template: &KmerMinHash) -> Result<KmerMinHash> {
    if query.ksize() != template.ksize() {
        return Err(Error::MismatchKSizes);
    }
    if query.hash_function() != template.hash_function() {
        return Err(Error::MismatchDNAProt);
    }
    if query.seed() != template.seed() {
        return Err(Error::MismatchSeed);
    }
    if query.scaled() > template.scaled() {
        return Err(Error::MismatchScaled);
    }
    query.downsample_scaled(template.scaled())
}

/// References sharing at least `threshold_hashes` with `query`, best
/// candidates first.
pub fn prefetch(
    query: &KmerMinHash,
    against: &[SmallSignature],
    threshold_hashes: usize,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = against
        .par_iter()
        .filter_map(|against| {
            let overlap = match against.minhash.count_common(query, false) {
                Ok(overlap) => overlap as usize,
                Err(e) => {
                    debug!("skipping '{}' in prefetch: {}", against.name, e);
                    return None;
                }
            };
            if overlap >= threshold_hashes && overlap > 0 {
                Some(Candidate {
                    name: against.name.clone(),
                    md5sum: against.md5sum.clone(),
                    minhash: against.minhash.clone(),
                    orig_overlap: overlap,
                    overlap,
                })
            } else {
                None
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.key().cmp(&a.key()));
    candidates
}

/// Run the greedy cover of `query` over prefetched `candidates`.
///
/// Each rank covers at least `threshold_hashes` new hashes, so the residual
/// query shrinks strictly until no candidate reaches the threshold.
pub fn consume_query_by_gather(
    query: &SmallSignature,
    candidates: Vec<Candidate>,
    threshold_hashes: usize,
) -> Result<Vec<GatherResult>> {
    let threshold_hashes = threshold_hashes.max(1);
    let mut residual = query.minhash.clone();
    let mut candidates = candidates;
    let mut results = vec![];

    trace!(
        "{}: start: query hashes={} matches={}",
        query.location,
        residual.size(),
        candidates.len()
    );

    while !residual.is_empty() && !candidates.is_empty() {
        let best_idx = candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.key().cmp(&b.key()))
            .map(|(i, _)| i);
        let best = match best_idx {
            Some(i) => candidates.swap_remove(i),
            None => break,
        };

        residual.remove_from(&best.minhash)?;
        results.push(GatherResult::from_rank(
            query,
            &best.name,
            &best.md5sum,
            &RankOverlap {
                rank: results.len(),
                overlap: best.overlap,
                orig_overlap: best.orig_overlap,
                match_size: best.minhash.size(),
                remaining_hashes: residual.size(),
            },
        ));

        // recalculate remaining overlaps between query and all candidates
        let current = &residual;
        candidates = candidates
            .into_par_iter()
            .filter_map(|mut candidate| {
                let overlap = candidate.minhash.count_common(current, false).ok()? as usize;
                if overlap >= threshold_hashes {
                    candidate.overlap = overlap;
                    Some(candidate)
                } else {
                    None
                }
            })
            .collect();

        trace!(
            "{} iter {}: remaining: query hashes={} matches={}",
            query.location,
            results.len(),
            residual.size(),
            candidates.len()
        );
    }

    Ok(results)
}

/// Prefetch matches and gather ranks for one query.
#[derive(Debug, Default)]
pub struct GatherOutcome {
    pub prefetch: Vec<PrefetchResult>,
    pub gather: Vec<GatherResult>,
}

/// Gather one query against an in-memory list of references.
///
/// The query must already be at the references' parameters; see
/// [`prepare_query`].
pub fn fastgather(
    query: &SmallSignature,
    against: &[SmallSignature],
    params: &GatherParams,
    scheduler: &Scheduler,
) -> Result<GatherOutcome> {
    let threshold = params.threshold_hashes(query.minhash.scaled());
    scheduler.install(|| {
        let candidates = prefetch(&query.minhash, against, threshold);
        info!(
            "{} of {} references passed prefetch for '{}'",
            candidates.len(),
            against.len(),
            query.name
        );
        let prefetch = candidates
            .iter()
            .map(|c| PrefetchResult::new(query, c))
            .collect();
        let gather = consume_query_by_gather(query, candidates, threshold)?;
        Ok(GatherOutcome { prefetch, gather })
    })?
}

/// Per-query outcome counts of a multigather.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatherStats {
    /// queries gathered
    pub processed: usize,
    /// queries incompatible with the references
    pub skipped: usize,
    /// queries with no match above the threshold
    pub no_matches: usize,
}

#[derive(Default)]
struct StatsCounter {
    processed: AtomicUsize,
    skipped: AtomicUsize,
    no_matches: AtomicUsize,
}

impl StatsCounter {
    fn finish(self, what: &str) -> GatherStats {
        let stats = GatherStats {
            processed: self.processed.into_inner(),
            skipped: self.skipped.into_inner(),
            no_matches: self.no_matches.into_inner(),
        };
        info!("{}: gathered {} queries", what, stats.processed);
        if stats.skipped > 0 {
            warn!(
                "{}: skipped {} queries incompatible with the references",
                what, stats.skipped
            );
        }
        if stats.no_matches > 0 {
            warn!("{}: {} queries had no matches", what, stats.no_matches);
        }
        stats
    }

    fn record(&self, results: &[GatherResult]) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if results.is_empty() {
            self.no_matches.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Gather many queries against one shared in-memory list of references.
///
/// Each query runs as its own task with private residual state. Gather
/// results of a query are emitted to `sink` as one batch.
pub fn fastmultigather<S: ResultSink<GatherResult>>(
    queries: &[SmallSignature],
    against: &[SmallSignature],
    params: &GatherParams,
    scheduler: &Scheduler,
    sink: &S,
) -> Result<GatherStats> {
    let template = match against.first() {
        Some(first) => &first.minhash,
        None => return Ok(GatherStats::default()),
    };
    let stats = StatsCounter::default();

    scheduler.install(|| {
        queries.par_iter().try_for_each(|query| {
            let minhash = match prepare_query(&query.minhash, template) {
                Ok(mh) => mh,
                Err(e) => {
                    warn!("skipping query '{}': {}", query.name, e);
                    stats.skipped.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            };
            let query = SmallSignature {
                minhash,
                ..query.clone()
            };
            let threshold = params.threshold_hashes(query.minhash.scaled());
            let candidates = prefetch(&query.minhash, against, threshold);
            let results = consume_query_by_gather(&query, candidates, threshold)?;
            stats.record(&results);
            if results.is_empty() {
                Ok(())
            } else {
                sink.emit(results)
            }
        })
    })??;

    Ok(stats.finish("fastmultigather"))
}

/// Gather many queries against a RevIndex without loading its sketches.
pub fn multigather_rocksdb<S: ResultSink<GatherResult>>(
    queries: &[SmallSignature],
    index: &RevIndex,
    params: &GatherParams,
    scheduler: &Scheduler,
    sink: &S,
) -> Result<GatherStats> {
    let stats = StatsCounter::default();

    scheduler.install(|| {
        queries.par_iter().try_for_each(|query| {
            let minhash = match index.prepare_query(&query.minhash) {
                Ok(mh) => mh,
                Err(e) => {
                    warn!("skipping query '{}': {}", query.name, e);
                    stats.skipped.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            };
            let query = SmallSignature {
                minhash,
                ..query.clone()
            };
            let threshold = params.threshold_hashes(query.minhash.scaled());
            let counters = index.prepare_gather_counters(&query.minhash)?;
            let results = index.gather(counters, threshold, &query)?;
            stats.record(&results);
            if results.is_empty() {
                Ok(())
            } else {
                sink.emit(results)
            }
        })
    })??;

    Ok(stats.finish("multigather"))
}
