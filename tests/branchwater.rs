use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;

use camino::{Utf8Path as Path, Utf8PathBuf as PathBuf};
use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use tempfile::TempDir;

use branchwater::cmd::{self, GatherOutput, LoadOptions};
use branchwater::collection::SmallSignature;
use branchwater::encodings::HashFunctions;
use branchwater::gather::{self, GatherParams};
use branchwater::prelude::*;
use branchwater::search::{self, SimilarityColumn};
use branchwater::sketch::minhash::max_hash_for_scaled;
use branchwater::Error;

fn minhash(ksize: u32, scaled: u64, hashes: impl IntoIterator<Item = u64>) -> KmerMinHash {
    let mut mh = KmerMinHash::builder()
        .ksize(ksize)
        .hash_function(HashFunctions::murmur64_DNA)
        .max_hash(max_hash_for_scaled(scaled))
        .build();
    mh.add_many(&hashes.into_iter().collect::<Vec<_>>());
    mh
}

fn signature(name: &str, mh: KmerMinHash) -> Signature {
    Signature::builder().name(name).signatures(vec![mh]).build()
}

fn write_sig(path: &Path, sig: &Signature) {
    let mut file = File::create(path).unwrap();
    sig.to_writer(&mut file).unwrap();
}

fn write_pathlist(path: &Path, paths: &[PathBuf]) {
    let mut file = File::create(path).unwrap();
    for p in paths {
        writeln!(file, "{p}").unwrap();
    }
}

fn tmpdir() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let dir = PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    (tmp, dir)
}

/// Three references at ksize 31 and one at ksize 21, listed in a pathlist.
fn reference_list(dir: &Path) -> PathBuf {
    let sigs = [
        ("ref-a", 31, 0..100),
        ("ref-b", 31, 50..120),
        ("ref-c", 31, 200..230),
        ("ref-k21", 21, 0..100),
    ];
    let paths: Vec<PathBuf> = sigs
        .into_iter()
        .map(|(name, ksize, range)| {
            let path = dir.join(format!("{name}.sig"));
            write_sig(&path, &signature(name, minhash(ksize, 10, range)));
            path
        })
        .collect();

    let list = dir.join("refs.txt");
    write_pathlist(&list, &paths);
    list
}

fn query_file(dir: &Path) -> PathBuf {
    let sigs = vec![
        signature("q-ab", minhash(31, 10, (0..60).chain(100..120))),
        signature("q-c", minhash(31, 10, (200..230).chain(900..910))),
        signature("q-none", minhash(31, 10, 5000..5050)),
    ];
    let path = dir.join("queries.sig");
    serde_json::to_writer(File::create(&path).unwrap(), &sigs).unwrap();
    path
}

fn k31() -> LoadOptions {
    LoadOptions::builder()
        .selection(Selection::builder().ksize(31).build())
        .build()
}

fn sorted_rows(path: &Path) -> Vec<Vec<String>> {
    let mut rdr = csv::Reader::from_path(path).unwrap();
    let mut rows: Vec<Vec<String>> = rdr
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    rows.sort();
    rows
}

#[test]
fn index_skips_mismatched_ksize() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let list = reference_list(&dir);
    let db = dir.join("refs.rocksdb");

    let scheduler = Scheduler::single();
    let index = cmd::index(&list, &db, &k31(), false, &scheduler)?;
    assert_eq!(index.len(), 3);
    drop(index);

    let stats = cmd::check(&db, false, &scheduler)?;
    assert_eq!(stats.total_datasets, 3);
    // 0..120 shared by a and b, plus 200..230
    assert_eq!(stats.total_keys, 150);

    Ok(())
}

#[test]
fn full_check_finds_missing_external_sketch() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let list = reference_list(&dir);
    let db = dir.join("refs.rocksdb");
    let scheduler = Scheduler::single();
    drop(cmd::index(&list, &db, &k31(), false, &scheduler)?);

    std::fs::rename(dir.join("ref-b.sig"), dir.join("ref-b.sig.moved"))?;

    let quick = cmd::check(&db, true, &scheduler)?;
    assert_eq!(quick.total_datasets, 3);
    assert!(matches!(
        cmd::check(&db, false, &scheduler),
        Err(Error::CorruptIndex { .. })
    ));

    Ok(())
}

#[test]
fn index_with_nothing_matching_fails_before_creating_db() {
    let (_tmp, dir) = tmpdir();
    let sig = dir.join("k21.sig");
    write_sig(&sig, &signature("k21", minhash(21, 10, 0..100)));
    let list = dir.join("list.txt");
    write_pathlist(&list, &[sig]);

    let db = dir.join("out.rocksdb");
    let err = cmd::index(&list, &db, &k31(), true, &Scheduler::single()).unwrap_err();
    assert!(matches!(err, Error::EmptyCollection { .. }));
    assert!(err.to_string().contains("no sketches loaded"));
    assert!(!db.exists());
}

#[test]
fn manysearch_same_rows_from_index_and_files() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let list = reference_list(&dir);
    let queries = query_file(&dir);
    let db = dir.join("refs.rocksdb");
    let scheduler = Scheduler::new(2);
    drop(cmd::index(&list, &db, &k31(), true, &scheduler)?);

    let params = SearchParams::builder().threshold(0.0).build();

    let from_files = dir.join("files.csv");
    let from_db = dir.join("db.csv");
    cmd::manysearch(&queries, &list, &k31(), &params, Some(from_files.as_path()), &scheduler)?;
    let stats = cmd::manysearch(&queries, &db, &k31(), &params, Some(from_db.as_path()), &scheduler)?;
    assert_eq!(stats.rows, 3);

    let rows = sorted_rows(&from_files);
    assert_eq!(rows, sorted_rows(&from_db));
    let pairs: BTreeSet<_> = rows.iter().map(|r| (r[0].clone(), r[2].clone())).collect();
    assert_eq!(
        pairs,
        BTreeSet::from([
            ("q-ab".to_string(), "ref-a".to_string()),
            ("q-ab".to_string(), "ref-b".to_string()),
            ("q-c".to_string(), "ref-c".to_string()),
        ])
    );

    Ok(())
}

#[test]
fn multigather_same_ranks_from_index_and_files() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let list = reference_list(&dir);
    let queries = query_file(&dir);
    let db = dir.join("refs.rocksdb");
    let scheduler = Scheduler::new(2);
    drop(cmd::index(&list, &db, &k31(), false, &scheduler)?);

    let params = GatherParams::builder().threshold_bp(50).build();

    let from_files = dir.join("files.csv");
    let from_db = dir.join("db.csv");
    let stats = cmd::fastmultigather(
        &queries,
        &list,
        &k31(),
        &params,
        GatherOutput::Combined(Some(from_files.as_path())),
        &scheduler,
    )?;
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.no_matches, 1);

    cmd::fastmultigather(
        &queries,
        &db,
        &k31(),
        &params,
        GatherOutput::Combined(Some(from_db.as_path())),
        &scheduler,
    )?;

    let rows = sorted_rows(&from_files);
    assert_eq!(rows, sorted_rows(&from_db));
    let ranks: Vec<_> = rows
        .iter()
        .map(|r| (r[2].as_str(), r[1].as_str(), r[4].as_str(), r[6].as_str()))
        .collect();
    assert_eq!(
        ranks,
        [
            ("q-ab", "0", "ref-a", "60"),
            ("q-c", "0", "ref-c", "30"),
            ("q-ab", "1", "ref-b", "20"),
        ]
    );

    Ok(())
}

#[test]
fn multigather_writes_one_file_per_query() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let list = reference_list(&dir);
    let queries = query_file(&dir);
    let out = dir.join("gather");
    std::fs::create_dir(&out)?;

    let params = GatherParams::builder().threshold_bp(50).build();
    cmd::fastmultigather(
        &queries,
        &list,
        &k31(),
        &params,
        GatherOutput::PerQuery(&out),
        &Scheduler::single(),
    )?;

    assert!(out.join("q-ab.gather.csv").exists());
    assert!(out.join("q-c.gather.csv").exists());
    assert!(!out.join("q-none.gather.csv").exists());
    assert_eq!(sorted_rows(&out.join("q-ab.gather.csv")).len(), 2);

    Ok(())
}

#[test]
fn fastgather_with_prefetch() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let list = reference_list(&dir);
    let query = dir.join("query.sig");
    write_sig(&query, &signature("q", minhash(31, 10, 0..120)));

    let gather_csv = dir.join("gather.csv");
    let prefetch_csv = dir.join("prefetch.csv");
    let outcome = cmd::fastgather(
        &query,
        &list,
        &k31(),
        &GatherParams::builder().threshold_bp(10).build(),
        Some(gather_csv.as_path()),
        Some(prefetch_csv.as_path()),
        &Scheduler::single(),
    )?;

    assert_eq!(outcome.prefetch.len(), 2);
    assert_eq!(outcome.gather.len(), 2);
    assert_eq!(outcome.gather[0].match_name(), "ref-a");
    assert_eq!(outcome.gather[1].overlap(), 20);
    assert_eq!(outcome.gather[1].remaining_bp(), 0);
    assert_eq!(sorted_rows(&prefetch_csv).len(), 2);
    assert_eq!(sorted_rows(&gather_csv).len(), 2);

    Ok(())
}

#[test]
fn pairwise_then_cluster() -> Result<(), Box<dyn std::error::Error>> {
    let (_tmp, dir) = tmpdir();
    let sigs = vec![
        signature("a", minhash(31, 10, 0..100)),
        signature("b", minhash(31, 10, 5..100)),
        signature("c", minhash(31, 10, 500..600)),
        signature("d", minhash(31, 10, 590..700)),
    ];
    let all = dir.join("all.sig");
    serde_json::to_writer(File::create(&all)?, &sigs)?;

    let pairwise_csv = dir.join("pairwise.csv");
    let params = SearchParams::builder().threshold(0.01).build();
    let stats = cmd::pairwise(
        &all,
        &LoadOptions::default(),
        &params,
        false,
        Some(pairwise_csv.as_path()),
        &Scheduler::single(),
    )?;
    assert_eq!(stats.rows, 2);

    let clusters_csv = dir.join("clusters.csv");
    let sizes_csv = dir.join("sizes.csv");
    let clustering = cmd::cluster(
        &pairwise_csv,
        SimilarityColumn::Containment,
        0.5,
        Some(clusters_csv.as_path()),
        Some(sizes_csv.as_path()),
    )?;

    assert_eq!(clustering.components.len(), 3);

    let mut rdr = csv::Reader::from_path(&clusters_csv)?;
    assert_eq!(rdr.headers()?.iter().collect::<Vec<_>>(), ["cluster", "nodes"]);
    let rows = sorted_rows(&clusters_csv);
    let names: BTreeSet<_> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(
        names,
        BTreeSet::from(["Component_1", "Component_2", "Component_3"])
    );
    let nodes: BTreeSet<_> = rows.iter().map(|r| r[1].as_str()).collect();
    assert_eq!(nodes, BTreeSet::from(["a;b", "c", "d"]));

    assert_eq!(
        sorted_rows(&sizes_csv),
        vec![
            vec!["1".to_string(), "2".to_string()],
            vec!["2".to_string(), "1".to_string()],
        ]
    );

    Ok(())
}

fn small(name: &str, hashes: &BTreeSet<u64>) -> SmallSignature {
    let mh = minhash(21, 1, hashes.iter().copied());
    SmallSignature {
        location: format!("{name}.sig"),
        name: name.into(),
        md5sum: mh.md5sum(),
        minhash: mh,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn jaccard_and_containment_identities(
        a in btree_set(0u64..400, 1..80),
        b in btree_set(0u64..400, 1..80),
    ) {
        let params = SearchParams::builder().threshold(0.0).build();
        let (qa, qb) = (small("a", &a), small("b", &b));
        let common = a.intersection(&b).count();

        match search::compare(&qa, &qb, &params).unwrap() {
            None => prop_assert_eq!(common, 0),
            Some(r) => {
                let union = a.len() + b.len() - common;
                prop_assert_eq!(r.intersect_hashes, common);
                prop_assert!((r.jaccard - common as f64 / union as f64).abs() < 1e-12);
                prop_assert!((r.containment - common as f64 / a.len() as f64).abs() < 1e-12);
                prop_assert!(r.max_containment >= r.containment);
                prop_assert!(r.max_containment >= r.match_containment);
                prop_assert!(r.jaccard <= r.containment.min(r.match_containment));

                let back = search::compare(&qb, &qa, &params).unwrap().unwrap();
                prop_assert_eq!(back.jaccard, r.jaccard);
                prop_assert_eq!(back.containment, r.match_containment);
            }
        }
    }

    #[test]
    fn gather_partitions_the_covered_query(
        query in btree_set(0u64..300, 1..120),
        refs in vec(btree_set(0u64..300, 1..60), 1..6),
    ) {
        let q = small("query", &query);
        let against: Vec<_> = refs
            .iter()
            .enumerate()
            .map(|(i, hashes)| small(&format!("ref{i}"), hashes))
            .collect();

        let params = GatherParams::builder().threshold_bp(1).build();
        let outcome = gather::fastgather(&q, &against, &params, &Scheduler::single()).unwrap();

        let covered: BTreeSet<u64> = refs
            .iter()
            .flat_map(|r| r.intersection(&query).copied())
            .collect();
        let total: usize = outcome.gather.iter().map(|r| r.overlap()).sum();
        prop_assert_eq!(total, covered.len());

        let mut remaining = query.len() as u64;
        let mut last_overlap = usize::MAX;
        let mut names = BTreeSet::new();
        for (rank, r) in outcome.gather.iter().enumerate() {
            prop_assert_eq!(r.rank(), rank);
            prop_assert!(r.overlap() >= 1);
            prop_assert!(r.overlap() <= last_overlap);
            remaining -= r.overlap() as u64;
            prop_assert_eq!(r.remaining_bp(), remaining);
            prop_assert!(names.insert(r.match_name().clone()));
            last_overlap = r.overlap();
        }
    }
}
