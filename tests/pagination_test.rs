// Drives the window paginator and the partition pipeline against an
// in-memory catalog that behaves like a VTEX search endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use precios_cli::pipeline::{harvest_partitions, rows_from_harvest, RunOptions};
use precios_cli::vtex::paginate::{PaginationConfig, Paginator, SplitStrategy};
use precios_cli::vtex::{
    BrandFacet, CommercialOffer, Facets, Item, Product, SearchBackend, SearchPage, SearchQuery,
    Seller, VtexError,
};

struct FakeStore {
    catalog: Vec<Product>,
    report_totals: bool,
    /// Offsets at or past this are refused the way VTEX answers HTTP 400.
    refuse_from: Option<usize>,
    failing_filter: Option<String>,
    /// Pages starting at or past this offset answer HTTP 500.
    fail_from: Option<usize>,
    /// Whether `O=OrderByPriceDESC` is honoured.
    sorts_by_price: bool,
    searches: AtomicUsize,
    facet_calls: AtomicUsize,
}

impl FakeStore {
    fn new(catalog: Vec<Product>) -> Self {
        Self {
            catalog,
            report_totals: true,
            refuse_from: None,
            failing_filter: None,
            fail_from: None,
            sorts_by_price: true,
            searches: AtomicUsize::new(0),
            facet_calls: AtomicUsize::new(0),
        }
    }

    fn matching(&self, query: &SearchQuery) -> Vec<&Product> {
        let mut found: Vec<&Product> = self
            .catalog
            .iter()
            .filter(|p| query.fq.iter().all(|fq| filter_matches(fq, p)))
            .filter(|p| match &query.ft {
                Some(ft) => p
                    .product_name
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase()
                    .starts_with(ft.as_str()),
                None => true,
            })
            .collect();
        if self.sorts_by_price && query.order_by.as_deref() == Some("OrderByPriceDESC") {
            found.sort_by(|a, b| price_of(b).total_cmp(&price_of(a)));
        }
        found
    }
}

fn server_error() -> VtexError {
    VtexError::HttpFailure {
        url: "fake".to_string(),
        status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        message: "boom".to_string(),
    }
}

fn price_of(product: &Product) -> f64 {
    product.items[0].sellers[0]
        .offer
        .as_ref()
        .and_then(|o| o.price)
        .unwrap_or_default()
}

fn filter_matches(fq: &str, product: &Product) -> bool {
    if let Some(brand) = fq.strip_prefix("B:") {
        return product.brand_id.map(|b| b.to_string()).as_deref() == Some(brand);
    }
    if let Some(range) = fq.strip_prefix("P:[").and_then(|r| r.strip_suffix(']')) {
        let (lo, hi) = range.split_once(" TO ").unwrap();
        let price = price_of(product);
        return price >= lo.parse::<f64>().unwrap() && price <= hi.parse::<f64>().unwrap();
    }
    if let Some(category) = fq.strip_prefix("C:") {
        return product.category_id.as_deref() == Some(category);
    }
    true
}

#[async_trait]
impl SearchBackend for FakeStore {
    async fn search(
        &self,
        query: &SearchQuery,
        from: usize,
        to: usize,
    ) -> Result<SearchPage, VtexError> {
        if let Some(bad) = &self.failing_filter {
            if query.fq.contains(bad) {
                return Err(server_error());
            }
        }
        if self.fail_from.is_some_and(|limit| from >= limit) {
            return Err(server_error());
        }
        if self.refuse_from.is_some_and(|limit| from >= limit) {
            return Err(VtexError::WindowExceeded { from });
        }
        self.searches.fetch_add(1, Ordering::SeqCst);

        let matching = self.matching(query);
        let products = matching
            .iter()
            .skip(from)
            .take(to + 1 - from)
            .map(|p| (*p).clone())
            .collect();
        Ok(SearchPage {
            products,
            total: self.report_totals.then_some(matching.len()),
        })
    }

    async fn facets(&self, query: &SearchQuery) -> Result<Facets, VtexError> {
        self.facet_calls.fetch_add(1, Ordering::SeqCst);
        let mut brands: Vec<BrandFacet> = Vec::new();
        for product in self.matching(query) {
            let Some(id) = product.brand_id else { continue };
            match brands.iter_mut().find(|b| b.id == Some(id)) {
                Some(facet) => facet.quantity += 1,
                None => brands.push(BrandFacet {
                    id: Some(id),
                    name: Some(format!("Brand {}", id)),
                    quantity: 1,
                }),
            }
        }
        Ok(Facets {
            brands,
            price_ranges: Vec::new(),
        })
    }
}

fn product(id: usize, name: &str, brand_id: Option<i64>, price: f64, category: &str) -> Product {
    Product {
        product_id: Some(id.to_string()),
        product_name: Some(name.to_string()),
        brand_id,
        link_text: Some(format!("producto-{}", id)),
        category_id: Some(category.to_string()),
        categories: vec!["/Almacén/Infusiones/".to_string()],
        items: vec![Item {
            item_id: Some(format!("sku-{}", id)),
            sellers: vec![Seller {
                seller_default: true,
                offer: Some(CommercialOffer {
                    price: Some(price),
                    list_price: Some(price),
                    ..CommercialOffer::default()
                }),
                ..Seller::default()
            }],
            ..Item::default()
        }],
        ..Product::default()
    }
}

fn config(split_order: Vec<SplitStrategy>) -> PaginationConfig {
    PaginationConfig {
        step: 10,
        window_cap: 30,
        page_delay: Duration::ZERO,
        split_order,
        ..PaginationConfig::default()
    }
}

fn branded_catalog(brands: i64, per_brand: usize) -> Vec<Product> {
    let mut catalog = Vec::new();
    for brand in 0..brands {
        for n in 0..per_brand {
            let id = brand as usize * 1000 + n;
            catalog.push(product(id, "yerba", Some(brand + 1), 100.0 + n as f64, "1"));
        }
    }
    catalog
}

#[tokio::test]
async fn test_partition_below_window_is_not_split() {
    let store = FakeStore::new(branded_catalog(1, 25));
    let config = config(vec![SplitStrategy::Brand]);

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::new(Some(1)))
        .await;

    assert_eq!(harvest.len(), 25);
    assert_eq!(harvest.requests, 3);
    assert_eq!(harvest.partitions, 1);
    assert_eq!(harvest.capped_leaves, 0);
    assert_eq!(store.facet_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_page_before_window_edge_ends_listing() {
    let mut store = FakeStore::new(branded_catalog(1, 20));
    store.report_totals = false;
    let config = config(vec![SplitStrategy::Brand]);

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    // two full pages, then an empty one right below the window
    assert_eq!(harvest.len(), 20);
    assert_eq!(harvest.requests, 3);
    assert_eq!(harvest.capped_leaves, 0);
    assert_eq!(store.facet_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_capped_partition_splits_by_brand() {
    let store = FakeStore::new(branded_catalog(4, 15));
    let config = config(vec![SplitStrategy::Brand, SplitStrategy::Alphabet]);

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 60);
    assert_eq!(harvest.capped_leaves, 0);
    assert_eq!(harvest.partitions, 5);
    // one cut-short root page plus two pages per brand
    assert_eq!(harvest.requests, 9);
}

#[tokio::test]
async fn test_alphabet_sweep_when_no_brand_facets() {
    let mut catalog = Vec::new();
    for (i, letter) in ["arroz", "bizcochos", "cafe", "dulce", "especias", "fideos"]
        .iter()
        .enumerate()
    {
        for n in 0..10 {
            catalog.push(product(i * 100 + n, letter, None, 50.0, "1"));
        }
    }
    let store = FakeStore::new(catalog);
    let config = config(vec![SplitStrategy::Brand, SplitStrategy::Alphabet]);

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 60);
    assert_eq!(harvest.capped_leaves, 0);
}

#[tokio::test]
async fn test_price_bisection_without_facet_ranges() {
    let mut catalog = Vec::new();
    for n in 0..50 {
        catalog.push(product(n, "leche", None, 10.0 * (n + 1) as f64, "1"));
    }
    let store = FakeStore::new(catalog);
    let config = PaginationConfig {
        max_price: 1000.0,
        ..config(vec![SplitStrategy::PriceRange])
    };

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 50);
    assert_eq!(harvest.capped_leaves, 0);
}

#[tokio::test]
async fn test_capped_leaf_without_strategies_keeps_window() {
    let store = FakeStore::new(branded_catalog(1, 50));
    let config = config(Vec::new());

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 30);
    assert_eq!(harvest.capped_leaves, 1);
}

#[tokio::test]
async fn test_window_refusal_triggers_split() {
    let mut store = FakeStore::new(branded_catalog(3, 15));
    store.report_totals = false;
    store.refuse_from = Some(20);
    let config = PaginationConfig {
        window_cap: 2500,
        ..config(vec![SplitStrategy::Brand])
    };

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 45);
    assert_eq!(harvest.capped_leaves, 0);
}

#[tokio::test]
async fn test_harvest_partitions_merges_and_reports_failures() {
    let mut catalog = branded_catalog(1, 12);
    // same products listed under a second category
    catalog.extend(branded_catalog(1, 12).into_iter().map(|mut p| {
        p.category_id = Some("2".to_string());
        p
    }));
    let mut store = FakeStore::new(catalog);
    store.failing_filter = Some("C:99".to_string());

    let partitions = vec![
        ("Almacén".to_string(), SearchQuery::default().with_filter("C:1")),
        ("Bebidas".to_string(), SearchQuery::default().with_filter("C:2")),
        ("Rota".to_string(), SearchQuery::default().with_filter("C:99")),
    ];
    let options = RunOptions {
        pagination: config(vec![SplitStrategy::Brand]),
        max_workers: 2,
        ..RunOptions::default()
    };

    let mut seen = Vec::new();
    let (harvest, failed) = harvest_partitions(&store, partitions, &options, |report, done, total| {
        assert_eq!(total, 3);
        seen.push((report.label.clone(), report.error.is_some(), done));
    })
    .await;

    assert_eq!(failed, 1);
    assert_eq!(harvest.len(), 12);
    assert_eq!(harvest.partial, 1);
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().any(|(label, err, _)| label == "Rota" && *err));

    let rows = rows_from_harvest("https://www.tienda.com.ar", &harvest);
    assert_eq!(rows.len(), 12);
    assert!(rows.iter().all(|r| r.sku.is_some() && r.list_price.is_some()));
    assert_eq!(rows[0].category.as_deref(), Some("Almacén"));
    assert_eq!(
        rows[0].url.as_deref(),
        Some("https://www.tienda.com.ar/producto-0/p")
    );
}

#[tokio::test]
async fn test_failing_page_keeps_products_already_swept() {
    let mut store = FakeStore::new(branded_catalog(1, 100));
    store.fail_from = Some(80);
    let config = PaginationConfig {
        window_cap: 2500,
        ..config(vec![SplitStrategy::Brand])
    };

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 80);
    assert_eq!(harvest.partial, 1);
    assert_eq!(harvest.errors.len(), 1);
    assert_eq!(harvest.requests, 8);
}

#[tokio::test]
async fn test_incomplete_partition_still_merges_its_products() {
    let mut store = FakeStore::new(branded_catalog(1, 100));
    store.fail_from = Some(80);
    let options = RunOptions {
        pagination: PaginationConfig {
            window_cap: 2500,
            ..config(vec![SplitStrategy::Brand])
        },
        max_workers: 1,
        ..RunOptions::default()
    };

    let mut reports = Vec::new();
    let (harvest, incomplete) = harvest_partitions(
        &store,
        vec![("Almacén".to_string(), SearchQuery::default())],
        &options,
        |report, _, _| reports.push(report.clone()),
    )
    .await;

    assert_eq!(incomplete, 1);
    assert_eq!(harvest.len(), 80);
    assert_eq!(reports[0].products, 80);
    assert!(reports[0].error.as_deref().unwrap_or_default().contains("boom"));
}

fn catalog_with_one_expensive_item() -> Vec<Product> {
    let mut catalog: Vec<Product> = (0..40)
        .map(|n| product(n, "televisor", None, 10.0 * (n + 1) as f64, "1"))
        .collect();
    catalog.push(product(999, "televisor oled", None, 6_500_000.0, "1"));
    catalog
}

#[tokio::test]
async fn test_price_split_reaches_above_default_ceiling() {
    let store = FakeStore::new(catalog_with_one_expensive_item());
    let config = config(vec![SplitStrategy::PriceRange]);

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 41);
    assert!(harvest
        .products
        .iter()
        .any(|p| p.product_id.as_deref() == Some("999")));
    assert_eq!(harvest.capped_leaves, 0);
}

#[tokio::test]
async fn test_open_price_range_catches_items_when_order_is_ignored() {
    let mut store = FakeStore::new(catalog_with_one_expensive_item());
    store.sorts_by_price = false;
    let config = config(vec![SplitStrategy::PriceRange]);

    let harvest = Paginator::new(&store, &config)
        .harvest(&SearchQuery::default())
        .await;

    assert_eq!(harvest.len(), 41);
    assert_eq!(harvest.capped_leaves, 0);
}
