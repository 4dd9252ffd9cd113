use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::normalize::{dedup_rows, normalize_ean, rows_from_product, ProductRow};
use crate::stores::StoreProfile;
use crate::vtex::discovery::{default_seeds, queries_for, term_queries, CatalogSource};
use crate::vtex::paginate::{Harvest, PaginationConfig, Paginator};
use crate::vtex::{SearchBackend, SearchQuery, VtexClient};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pagination: PaginationConfig,
    pub max_workers: usize,
    /// Only the first N partitions are harvested; handy for smoke runs.
    pub max_partitions: Option<usize>,
    pub term_seeds: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            pagination: PaginationConfig::default(),
            max_workers: 6,
            max_partitions: None,
            term_seeds: default_seeds(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionReport {
    pub label: String,
    pub products: usize,
    pub requests: usize,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct StoreRun {
    pub run_id: Uuid,
    pub codigo: String,
    pub rows: Vec<ProductRow>,
    pub products: usize,
    pub partitions: usize,
    pub failed_partitions: usize,
    pub requests: usize,
    pub capped_leaves: usize,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
}

/// Partitions for the profile's catalog source, labelled for logging.
pub async fn discover(
    client: &VtexClient,
    profile: &StoreProfile,
    options: &RunOptions,
) -> Result<Vec<(String, SearchQuery)>> {
    let sc = profile.sales_channel;
    let mut partitions = match &profile.source {
        CatalogSource::Categories { depth, .. } => {
            let tree = client
                .category_tree(*depth)
                .await
                .with_context(|| format!("Failed to load category tree for {}", profile.codigo))?;
            let partitions = queries_for(&profile.source, &tree, sc);
            info!(
                "{}: {} categories discovered (depth {})",
                profile.codigo,
                partitions.len(),
                depth
            );
            partitions
        }
        other => queries_for(other, &[], sc),
    };

    if profile.term_sweep && !matches!(profile.source, CatalogSource::Terms(_)) {
        partitions.extend(term_queries(&options.term_seeds, sc));
    }
    if let Some(limit) = options.max_partitions {
        partitions.truncate(limit);
    }
    Ok(partitions)
}

/// Harvests partitions concurrently and merges them into one deduplicated set.
/// A partition whose sweep broke off on a failing page is reported as
/// incomplete; the products it did fetch are still merged.
pub async fn harvest_partitions<B, F>(
    backend: &B,
    partitions: Vec<(String, SearchQuery)>,
    options: &RunOptions,
    mut progress: F,
) -> (Harvest, usize)
where
    B: SearchBackend + ?Sized,
    F: FnMut(&PartitionReport, usize, usize),
{
    let total = partitions.len();
    let workers = options.max_workers.max(1);
    let pagination = &options.pagination;

    let mut pending = stream::iter(partitions)
        .map(|(label, query)| async move {
            let paginator = Paginator::new(backend, pagination);
            (label, paginator.harvest(&query).await)
        })
        .buffer_unordered(workers);

    let mut merged = Harvest::default();
    let mut incomplete = 0;
    let mut completed = 0;

    while let Some((label, harvest)) = pending.next().await {
        completed += 1;
        let error = if harvest.is_partial() {
            incomplete += 1;
            let joined = harvest.errors.join("; ");
            error!(
                "Partition [{}] incomplete, kept {} products: {}",
                label,
                harvest.len(),
                joined
            );
            Some(joined)
        } else {
            None
        };
        let report = PartitionReport {
            label,
            products: harvest.len(),
            requests: harvest.requests,
            error,
        };
        merged.merge(harvest);
        progress(&report, completed, total);
    }

    (merged, incomplete)
}

pub fn rows_from_harvest(base_url: &str, harvest: &Harvest) -> Vec<ProductRow> {
    let rows = harvest
        .products
        .iter()
        .flat_map(|p| rows_from_product(base_url, p))
        .collect();
    dedup_rows(rows)
}

pub async fn run_store(
    client: &VtexClient,
    profile: &StoreProfile,
    options: &RunOptions,
) -> Result<StoreRun> {
    let run_id = Uuid::new_v4();
    let started_at = Local::now();
    let start = Instant::now();

    info!("Run {} started for {} ({})", run_id, profile.nombre, profile.base_url);

    let partitions = discover(client, profile, options).await?;
    let partition_count = partitions.len();

    let (harvest, failed) = harvest_partitions(client, partitions, options, |report, done, total| {
        match &report.error {
            None => info!(
                "  [{}/{}] ✓ {} -> {} products ({} requests)",
                done, total, report.label, report.products, report.requests
            ),
            Some(e) => info!(
                "  [{}/{}] ✗ {} -> {} products before: {}",
                done, total, report.label, report.products, e
            ),
        }
    })
    .await;

    let rows = rows_from_harvest(&profile.base_url, &harvest);
    info!(
        "Run {} for {}: {} products, {} SKU rows, {} partitions incomplete",
        run_id,
        profile.codigo,
        harvest.len(),
        rows.len(),
        failed
    );

    Ok(StoreRun {
        run_id,
        codigo: profile.codigo.clone(),
        products: harvest.len(),
        rows,
        partitions: partition_count,
        failed_partitions: failed,
        requests: harvest.requests,
        capped_leaves: harvest.capped_leaves,
        started_at,
        duration: start.elapsed(),
    })
}

/// One store's answer for one EAN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupHit {
    pub ean: String,
    pub tienda: String,
    pub nombre: String,
    pub marca: Option<String>,
    pub precio_lista: Option<f64>,
    pub precio_oferta: Option<f64>,
    pub tipo_oferta: Option<String>,
    pub url: Option<String>,
}

/// Searches every store for every EAN, `max_workers` requests at a time.
/// Only SKUs whose EAN matches the one asked for are reported.
pub async fn lookup_eans(
    stores: &[(StoreProfile, VtexClient)],
    eans: &[String],
    max_workers: usize,
) -> Vec<LookupHit> {
    let jobs: Vec<(&StoreProfile, &VtexClient, String)> = eans
        .iter()
        .filter_map(|e| normalize_ean(e))
        .flat_map(|ean| stores.iter().map(move |(p, c)| (p, c, ean.clone())))
        .collect();

    let results: Vec<Vec<LookupHit>> = stream::iter(jobs)
        .map(|(profile, client, ean)| async move {
            match client.search_by_ean(&ean, profile.sales_channel).await {
                Ok(products) => products
                    .iter()
                    .flat_map(|p| rows_from_product(client.base_url(), p))
                    .filter(|row| row.ean.as_deref() == Some(ean.as_str()))
                    .map(|row| LookupHit {
                        ean: ean.clone(),
                        tienda: profile.nombre.clone(),
                        nombre: row.name,
                        marca: row.brand,
                        precio_lista: row.list_price,
                        precio_oferta: row.offer_price,
                        tipo_oferta: row.offer_type,
                        url: row.url,
                    })
                    .collect(),
                Err(e) => {
                    warn!("EAN {} lookup on {} failed: {}", ean, profile.codigo, e);
                    Vec::new()
                }
            }
        })
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;

    let mut hits: Vec<LookupHit> = results.into_iter().flatten().collect();
    hits.sort_by(|a, b| a.ean.cmp(&b.ean).then(a.tienda.cmp(&b.tienda)));
    hits
}
