//! Single-linkage clustering of a pairwise similarity table.
//!
//! Nodes are the distinct names in the `query_name` and `match_name`
//! columns; an edge joins two nodes when the chosen similarity column is at
//! or above the threshold. Clusters are the connected components.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use camino::Utf8Path as Path;
use itertools::Itertools;
use log::info;
use serde::Serialize;

use crate::output::ResultType;
use crate::search::SimilarityColumn;
use crate::{Error, Result};

/// Disjoint sets over `0..n`, with path halving and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Nodes and weighted edges read from a pairwise CSV.
#[derive(Debug, Default, Clone)]
pub struct PairwiseTable {
    /// node names, in order of first appearance
    nodes: Vec<String>,
    /// `(query, match, value)`; rows with an empty value are kept out
    edges: Vec<(usize, usize, f64)>,
}

impl PairwiseTable {
    /// Read `query_name`, `match_name` and `column` from a pairwise CSV.
    pub fn from_reader<R: Read>(rdr: R, column: SimilarityColumn, path: &str) -> Result<Self> {
        let invalid = |message: String| Error::InvalidPairwiseTable {
            path: path.into(),
            message,
        };

        let mut rdr = csv::Reader::from_reader(rdr);
        let headers = rdr.headers()?.clone();
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| invalid(format!("missing column '{name}'")))
        };
        let q_col = position("query_name")?;
        let m_col = position("match_name")?;
        let v_col = position(column.as_str())?;

        let mut table = Self::default();
        let mut ids: HashMap<String, usize> = HashMap::new();

        for (line, row) in rdr.records().enumerate() {
            let row = row?;
            let field = |i: usize| {
                row.get(i)
                    .ok_or_else(|| invalid(format!("short row at line {}", line + 2)))
            };
            let query = table.node_id(&mut ids, field(q_col)?);
            let matched = table.node_id(&mut ids, field(m_col)?);

            let raw = field(v_col)?.trim();
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw.parse().map_err(|_| {
                invalid(format!(
                    "bad {} value '{}' at line {}",
                    column,
                    raw,
                    line + 2
                ))
            })?;
            table.edges.push((query, matched, value));
        }

        Ok(table)
    }

    pub fn from_path<P: AsRef<Path>>(path: P, column: SimilarityColumn) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|_| Error::MissingPath {
            path: path.to_string(),
        })?;
        Self::from_reader(std::io::BufReader::new(file), column, path.as_str())
    }

    fn node_id(&mut self, ids: &mut HashMap<String, usize>, name: &str) -> usize {
        if let Some(id) = ids.get(name) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(name.into());
        ids.insert(name.into(), id);
        id
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// Connected components with edges at or above `threshold`.
    ///
    /// Components are ordered by their first-appearing node, and members
    /// keep first-appearance order too.
    pub fn components(&self, threshold: f64) -> Vec<Vec<&str>> {
        let mut uf = UnionFind::new(self.nodes.len());
        for &(a, b, value) in &self.edges {
            if a != b && value >= threshold {
                uf.union(a, b);
            }
        }

        let mut component_of: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<&str>> = vec![];
        for (id, name) in self.nodes.iter().enumerate() {
            let root = uf.find(id);
            let cid = *component_of.entry(root).or_insert_with(|| {
                components.push(vec![]);
                components.len() - 1
            });
            components[cid].push(name.as_str());
        }
        components
    }
}

/// ANI thresholds above 1 are taken as percentages.
pub fn normalize_threshold(column: SimilarityColumn, threshold: f64) -> f64 {
    if column.is_ani() && threshold > 1.0 {
        threshold / 100.0
    } else {
        threshold
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ClusterRow {
    pub cluster: String,
    pub nodes: String,
}

impl ResultType for ClusterRow {
    fn header_fields() -> &'static [&'static str] {
        &["cluster", "nodes"]
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ClusterSize {
    pub cluster_size: usize,
    pub count: usize,
}

impl ResultType for ClusterSize {
    fn header_fields() -> &'static [&'static str] {
        &["cluster_size", "count"]
    }
}

#[derive(Debug, Clone, Default)]
pub struct Clustering {
    pub components: Vec<Vec<String>>,
}

impl Clustering {
    /// One row per component, named `Component_1`, `Component_2`, ...
    pub fn rows(&self) -> Vec<ClusterRow> {
        self.components
            .iter()
            .enumerate()
            .map(|(i, nodes)| ClusterRow {
                cluster: format!("Component_{}", i + 1),
                nodes: nodes.iter().join(";"),
            })
            .collect()
    }

    /// Number of components of each size, smallest first.
    pub fn sizes(&self) -> Vec<ClusterSize> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for c in &self.components {
            *counts.entry(c.len()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(cluster_size, count)| ClusterSize {
                cluster_size,
                count,
            })
            .collect()
    }
}

/// Cluster an in-memory table.
pub fn cluster_table(
    table: &PairwiseTable,
    column: SimilarityColumn,
    threshold: f64,
) -> Clustering {
    let threshold = normalize_threshold(column, threshold);
    let components: Vec<Vec<String>> = table
        .components(threshold)
        .into_iter()
        .map(|c| c.into_iter().map(String::from).collect())
        .collect();

    info!(
        "{} nodes, {} edges in table; {} components at {} >= {}",
        table.nodes().len(),
        table.n_edges(),
        components.len(),
        column,
        threshold
    );

    Clustering { components }
}

/// Cluster the pairwise CSV at `path`.
pub fn cluster<P: AsRef<Path>>(
    path: P,
    column: SimilarityColumn,
    threshold: f64,
) -> Result<Clustering> {
    let table = PairwiseTable::from_path(path, column)?;
    Ok(cluster_table(&table, column, threshold))
}
