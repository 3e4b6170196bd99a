//! End-to-end commands.
//!
//! Each command loads its inputs and runs one engine on the given
//! [`Scheduler`], then writes CSV rows through a single writer thread.
//! Loading runs inside the same pool, so no other rayon pool is used.
//! Output paths of `None` write to stdout.

use std::sync::mpsc::SyncSender;

use camino::{Utf8Path as Path, Utf8PathBuf as PathBuf};
use log::{info, warn};
use typed_builder::TypedBuilder;

use crate::cluster::{self, Clustering};
use crate::collection::{CollectionSet, SmallSignature};
use crate::gather::{self, GatherOutcome, GatherParams, GatherResult, GatherStats};
use crate::index::revindex::{DbStats, RevIndex};
use crate::multicollection::{is_revindex_database, MultiCollection};
use crate::output::{csvwriter_thread, join_writer, result_channel, write_csv, ResultSink, ResultType};
use crate::scheduler::Scheduler;
use crate::search::{self, SearchParams, SearchResult, SearchStats, SimilarityColumn};
use crate::selection::Selection;
use crate::{Error, Result};

/// How input collections are loaded and filtered.
#[derive(TypedBuilder, Debug, Clone, Default)]
pub struct LoadOptions {
    #[builder(default)]
    pub selection: Selection,

    /// Keep going when some paths fail to load.
    #[builder(default = false)]
    pub allow_failed: bool,

    /// Downsample every sketch to the largest scaled found, instead of
    /// refusing collections with several scaled values.
    #[builder(default = false)]
    pub rescale: bool,
}

/// Load a reference collection with one ksize, moltype and scaled.
fn load_uniform(
    path: &Path,
    opts: &LoadOptions,
    scheduler: &Scheduler,
) -> Result<(MultiCollection, Selection)> {
    scheduler.install(|| {
        let (multi, _report) = MultiCollection::load(path, &opts.selection, opts.allow_failed)?;
        multi.select_uniform(&opts.selection, opts.rescale, path.as_str())
    })?
}

/// Like [`load_uniform`], with every sketch loaded into memory.
fn load_uniform_sketches(
    path: &Path,
    opts: &LoadOptions,
    scheduler: &Scheduler,
) -> Result<(Vec<SmallSignature>, Selection)> {
    let (multi, selection) = load_uniform(path, opts, scheduler)?;
    let sketches = scheduler.install(|| multi.load_sketches())?;
    Ok((sketches, selection))
}

/// Load query sketches compatible with `against`.
///
/// Queries keep their own scaled; engines downsample as needed.
fn load_queries(
    path: &Path,
    opts: &LoadOptions,
    against: &Selection,
    scheduler: &Scheduler,
) -> Result<Vec<SmallSignature>> {
    let mut selection = opts.selection.clone();
    if let Some(ksize) = against.ksize() {
        selection.set_ksize(ksize);
    }
    if let Some(moltype) = against.moltype() {
        selection.set_moltype(moltype);
    }

    let sketches = scheduler.install(|| {
        let (multi, _report) = MultiCollection::load(path, &selection, opts.allow_failed)?;
        Ok::<_, Error>(multi.load_sketches())
    })??;
    if sketches.is_empty() {
        return Err(Error::EmptyCollection {
            path: path.to_string(),
        });
    }
    Ok(sketches)
}

/// Run `work` with a sender feeding a CSV writer thread.
///
/// The writer is always joined; an error from `work` wins over a writer
/// error.
fn with_csv_writer<T, R, F>(output: Option<&Path>, work: F) -> Result<R>
where
    T: ResultType + Send + 'static,
    F: FnOnce(&SyncSender<Vec<T>>) -> Result<R>,
{
    let (send, recv) = result_channel::<T>();
    let handle = csvwriter_thread(recv, output)?;

    let outcome = work(&send);
    drop(send);
    let written = join_writer(handle);

    let outcome = outcome?;
    info!("wrote {} rows", written?);
    Ok(outcome)
}

/// Build a RevIndex at `output` from the sketches in `siglist`.
///
/// Sketches not matching `opts.selection` are skipped; an input where
/// nothing matches fails before the database is created.
pub fn index(
    siglist: &Path,
    output: &Path,
    opts: &LoadOptions,
    use_internal_storage: bool,
    scheduler: &Scheduler,
) -> Result<RevIndex> {
    info!("Loading sketches from {}", siglist);
    let (multi, _selection) = load_uniform(siglist, opts, scheduler)?;
    info!("Found {} sketches total.", multi.len());

    scheduler.install(|| {
        let collection = multi.into_collection(!use_internal_storage)?;
        let collection = CollectionSet::try_from(collection)?;
        RevIndex::create(output, collection, use_internal_storage)
    })?
}

pub fn check(index: &Path, quick: bool, scheduler: &Scheduler) -> Result<DbStats> {
    scheduler.install(|| RevIndex::check(index, quick))?
}

pub fn upgrade(index: &Path) -> Result<()> {
    RevIndex::upgrade(index)
}

/// All-pairs comparison of the sketches in `siglist`.
pub fn pairwise(
    siglist: &Path,
    opts: &LoadOptions,
    params: &SearchParams,
    include_self: bool,
    output: Option<&Path>,
    scheduler: &Scheduler,
) -> Result<SearchStats> {
    let (sketches, _selection) = load_uniform_sketches(siglist, opts, scheduler)?;
    if sketches.len() < 2 && !include_self {
        warn!("only {} sketch(es) loaded; no pairs to compare", sketches.len());
    }

    with_csv_writer::<SearchResult, _, _>(output, |send| {
        search::pairwise(&sketches, params, include_self, scheduler, send)
    })
}

/// Every query against every reference, both held in memory.
pub fn multisearch(
    querylist: &Path,
    againstlist: &Path,
    opts: &LoadOptions,
    params: &SearchParams,
    output: Option<&Path>,
    scheduler: &Scheduler,
) -> Result<SearchStats> {
    let (against, selection) = load_uniform_sketches(againstlist, opts, scheduler)?;
    let queries = load_queries(querylist, opts, &selection, scheduler)?;

    with_csv_writer::<SearchResult, _, _>(output, |send| {
        search::multisearch(&queries, &against, params, scheduler, send)
    })
}

/// Queries in memory against references streamed from disk, or against a
/// RevIndex when `againstlist` is one.
pub fn manysearch(
    querylist: &Path,
    againstlist: &Path,
    opts: &LoadOptions,
    params: &SearchParams,
    output: Option<&Path>,
    scheduler: &Scheduler,
) -> Result<SearchStats> {
    if is_revindex_database(againstlist) {
        let index = RevIndex::open(againstlist, true)?;
        let queries = load_queries(querylist, opts, &index.selection()?, scheduler)?;
        return with_csv_writer::<SearchResult, _, _>(output, |send| {
            search::manysearch_rocksdb(&queries, &index, params, scheduler, send)
        });
    }

    let (against, selection) = load_uniform(againstlist, opts, scheduler)?;
    let queries = load_queries(querylist, opts, &selection, scheduler)?;

    with_csv_writer::<SearchResult, _, _>(output, |send| {
        search::manysearch(&queries, &against, params, scheduler, send)
    })
}

/// Gather the first sketch in `query` against `againstlist`.
///
/// Prefetch matches are written to `prefetch_output` when given.
pub fn fastgather(
    query: &Path,
    againstlist: &Path,
    opts: &LoadOptions,
    params: &GatherParams,
    gather_output: Option<&Path>,
    prefetch_output: Option<&Path>,
    scheduler: &Scheduler,
) -> Result<GatherOutcome> {
    let (against, selection) = load_uniform_sketches(againstlist, opts, scheduler)?;
    let template = against.first().ok_or_else(|| Error::EmptyCollection {
        path: againstlist.to_string(),
    })?;

    let queries = load_queries(query, opts, &selection, scheduler)?;
    if queries.len() > 1 {
        warn!(
            "{} sketches in '{}'; gathering only the first",
            queries.len(),
            query
        );
    }
    let query = &queries[0];
    let query = SmallSignature {
        minhash: gather::prepare_query(&query.minhash, &template.minhash)?,
        ..query.clone()
    };

    let outcome = gather::fastgather(&query, &against, params, scheduler)?;
    if let Some(path) = prefetch_output {
        write_csv(&outcome.prefetch, Some(path))?;
    }
    write_csv(&outcome.gather, gather_output)?;
    Ok(outcome)
}

/// Where multigather rows go.
#[derive(Debug, Clone, Copy)]
pub enum GatherOutput<'a> {
    /// one CSV holding every query, or stdout
    Combined(Option<&'a Path>),
    /// one `<query name>.gather.csv` per query under this directory
    PerQuery(&'a Path),
}

/// Writes every batch to its own CSV named after the query.
struct PerQueryCsv<'a> {
    dir: &'a Path,
}

fn output_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "query".into()
    } else {
        stem
    }
}

impl PerQueryCsv<'_> {
    fn path_for(&self, query_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.gather.csv", output_stem(query_name)))
    }
}

impl ResultSink<GatherResult> for PerQueryCsv<'_> {
    fn emit(&self, batch: Vec<GatherResult>) -> Result<()> {
        match batch.first() {
            Some(first) => write_csv(&batch, Some(self.path_for(first.query_name()))),
            None => Ok(()),
        }
    }
}

/// Gather many queries concurrently against one set of references, or
/// against a RevIndex when `againstlist` is one.
pub fn fastmultigather(
    querylist: &Path,
    againstlist: &Path,
    opts: &LoadOptions,
    params: &GatherParams,
    output: GatherOutput<'_>,
    scheduler: &Scheduler,
) -> Result<GatherStats> {
    if is_revindex_database(againstlist) {
        let index = RevIndex::open(againstlist, true)?;
        let queries = load_queries(querylist, opts, &index.selection()?, scheduler)?;
        return match output {
            GatherOutput::Combined(path) => with_csv_writer::<GatherResult, _, _>(path, |send| {
                gather::multigather_rocksdb(&queries, &index, params, scheduler, send)
            }),
            GatherOutput::PerQuery(dir) => {
                let sink = PerQueryCsv { dir };
                gather::multigather_rocksdb(&queries, &index, params, scheduler, &sink)
            }
        };
    }

    let (against, selection) = load_uniform_sketches(againstlist, opts, scheduler)?;
    let queries = load_queries(querylist, opts, &selection, scheduler)?;

    match output {
        GatherOutput::Combined(path) => with_csv_writer::<GatherResult, _, _>(path, |send| {
            gather::fastmultigather(&queries, &against, params, scheduler, send)
        }),
        GatherOutput::PerQuery(dir) => {
            let sink = PerQueryCsv { dir };
            gather::fastmultigather(&queries, &against, params, scheduler, &sink)
        }
    }
}

/// Cluster a pairwise CSV; component sizes go to `sizes_output` when
/// given.
pub fn cluster(
    pairwise_csv: &Path,
    column: SimilarityColumn,
    threshold: f64,
    output: Option<&Path>,
    sizes_output: Option<&Path>,
) -> Result<Clustering> {
    let clustering = cluster::cluster(pairwise_csv, column, threshold)?;
    write_csv(&clustering.rows(), output)?;
    if let Some(path) = sizes_output {
        write_csv(&clustering.sizes(), Some(path))?;
    }
    Ok(clustering)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn output_stems_are_file_safe() {
        assert_eq!(output_stem("NC_011665.1 Shewanella sp."), "NC_011665.1_Shewanella_sp.");
        assert_eq!(output_stem("a/b"), "a_b");
        assert_eq!(output_stem(""), "query");
    }

    #[test]
    fn per_query_paths() {
        let sink = PerQueryCsv {
            dir: Path::new("out"),
        };
        assert_eq!(sink.path_for("q 1"), PathBuf::from("out/q_1.gather.csv"));
    }
}
