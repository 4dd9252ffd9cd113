//! Catalog discovery: turns a store's category tree, a product cluster or a
//! list of search terms into the partitions the paginator harvests.

use serde::Serialize;

use super::{CategoryNode, SearchQuery};

/// Seeds for free-text sweeps. Single characters cover most product names;
/// the bigrams and retail words pick up items the category tree misses.
pub const DEFAULT_TERM_SEEDS: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "a", "b", "c", "d", "e", "f", "g", "h",
    "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z",
    "á", "é", "í", "ó", "ú", "ñ", "ch", "ll", "qu", "pa", "ca", "co", "ma", "la", "le", "de",
    "pro", "sal", "mix", "pack", "kit", "x2", "x3", "lt", "ml", "kg",
];

/// Characters used when a capped partition is split by `ft=` prefix.
pub const ALPHABET: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "a", "b", "c", "d", "e", "f", "g", "h",
    "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatCategory {
    pub id: i64,
    pub name: String,
    pub path: Vec<String>,
    pub depth: usize,
    pub is_leaf: bool,
}

impl FlatCategory {
    pub fn path_name(&self) -> String {
        self.path.join(" > ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogSource {
    Categories { depth: u32, leaves_only: bool },
    Cluster(String),
    Terms(Vec<String>),
}

/// Depth-first walk, parents before children.
pub fn flatten_tree(tree: &[CategoryNode]) -> Vec<FlatCategory> {
    fn walk(node: &CategoryNode, parent: &[String], out: &mut Vec<FlatCategory>) {
        let mut path = parent.to_vec();
        path.push(node.name.trim().to_string());
        out.push(FlatCategory {
            id: node.id,
            name: node.name.trim().to_string(),
            depth: path.len(),
            is_leaf: node.children.is_empty(),
            path: path.clone(),
        });
        for child in &node.children {
            walk(child, &path, out);
        }
    }

    let mut out = Vec::new();
    for node in tree {
        walk(node, &[], &mut out);
    }
    out
}

pub fn leaf_categories(tree: &[CategoryNode]) -> Vec<FlatCategory> {
    flatten_tree(tree)
        .into_iter()
        .filter(|c| c.is_leaf)
        .collect()
}

pub fn category_queries(
    categories: &[FlatCategory],
    sales_channel: Option<u32>,
) -> Vec<(String, SearchQuery)> {
    categories
        .iter()
        .map(|c| {
            (
                c.path_name(),
                SearchQuery::new(sales_channel).with_filter(format!("C:{}", c.id)),
            )
        })
        .collect()
}

pub fn cluster_query(cluster_id: &str, sales_channel: Option<u32>) -> (String, SearchQuery) {
    (
        format!("cluster {}", cluster_id),
        SearchQuery::new(sales_channel).with_filter(format!("productClusterIds:{}", cluster_id)),
    )
}

pub fn term_queries(seeds: &[String], sales_channel: Option<u32>) -> Vec<(String, SearchQuery)> {
    seeds
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| (format!("ft={}", s), SearchQuery::new(sales_channel).with_term(s)))
        .collect()
}

/// Partitions for a catalog source. `tree` is only read for
/// [`CatalogSource::Categories`].
pub fn queries_for(
    source: &CatalogSource,
    tree: &[CategoryNode],
    sales_channel: Option<u32>,
) -> Vec<(String, SearchQuery)> {
    match source {
        CatalogSource::Categories { leaves_only, .. } => {
            let categories = if *leaves_only {
                leaf_categories(tree)
            } else {
                flatten_tree(tree)
            };
            category_queries(&categories, sales_channel)
        }
        CatalogSource::Cluster(id) => vec![cluster_query(id, sales_channel)],
        CatalogSource::Terms(seeds) => term_queries(seeds, sales_channel),
    }
}

pub fn default_seeds() -> Vec<String> {
    DEFAULT_TERM_SEEDS.iter().map(|s| s.to_string()).collect()
}
