//! `_from/_to` window pagination over the VTEX search endpoint.
//!
//! The endpoint refuses offsets past a fixed window (2500 results on most
//! stores). A partition that reaches the window is split into narrower
//! filter sets and each one is paginated on its own; splits recurse until the
//! pieces fit or there is no strategy left.
//!
//! A page that still fails after the HTTP retries ends its sweep early. What
//! was fetched up to that point is kept and the partition is counted as
//! partial.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::discovery::ALPHABET;
use super::{Product, SearchBackend, SearchQuery, VtexError};

/// Upper bound of the open-ended range appended to every price split.
const OPEN_PRICE_CEILING: f64 = 1_000_000_000_000.0;
const PRICE_DESC: &str = "OrderByPriceDESC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    Brand,
    PriceRange,
    Alphabet,
}

impl std::str::FromStr for SplitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "brand" | "marca" => Ok(Self::Brand),
            "price" | "precio" => Ok(Self::PriceRange),
            "alpha" | "alphabet" => Ok(Self::Alphabet),
            other => Err(format!("unknown split strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub step: usize,
    pub window_cap: usize,
    pub empty_streak_limit: usize,
    pub page_delay: Duration,
    pub split_order: Vec<SplitStrategy>,
    pub max_price: f64,
    pub min_price_width: f64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            step: 50,
            window_cap: 2500,
            empty_streak_limit: 2,
            page_delay: Duration::from_millis(250),
            split_order: vec![
                SplitStrategy::Brand,
                SplitStrategy::PriceRange,
                SplitStrategy::Alphabet,
            ],
            max_price: 5_000_000.0,
            min_price_width: 1.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Harvest {
    pub products: Vec<Product>,
    pub requests: usize,
    pub partitions: usize,
    /// Partitions that still hit the window after every split was tried.
    pub capped_leaves: usize,
    /// Sweeps cut off by a failing page.
    pub partial: usize,
    pub errors: Vec<String>,
    seen: HashSet<String>,
}

impl Harvest {
    /// Adds products not seen before; returns how many were new.
    fn absorb(&mut self, products: Vec<Product>) -> usize {
        let mut added = 0;
        for product in products {
            let key = product_key(&product);
            if let Some(key) = key {
                if !self.seen.insert(key) {
                    continue;
                }
            }
            self.products.push(product);
            added += 1;
        }
        added
    }

    pub fn merge(&mut self, other: Harvest) {
        self.requests += other.requests;
        self.partitions += other.partitions;
        self.capped_leaves += other.capped_leaves;
        self.partial += other.partial;
        self.errors.extend(other.errors);
        self.absorb(other.products);
    }

    fn record_failure(&mut self, query: &SearchQuery, err: &VtexError) {
        self.partial += 1;
        self.errors.push(format!("[{}] {}", query.label(), err));
    }

    pub fn is_partial(&self) -> bool {
        self.partial > 0
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

fn product_key(product: &Product) -> Option<String> {
    product
        .product_id
        .clone()
        .or_else(|| product.link_text.clone())
}

struct Sweep {
    capped: bool,
    /// The sweep stopped after the first page because the reported total
    /// already exceeded the window.
    cut_short: bool,
}

pub struct Paginator<'a, B: SearchBackend + ?Sized> {
    backend: &'a B,
    config: &'a PaginationConfig,
}

impl<'a, B: SearchBackend + ?Sized> Paginator<'a, B> {
    pub fn new(backend: &'a B, config: &'a PaginationConfig) -> Self {
        Self { backend, config }
    }

    pub async fn harvest(&self, query: &SearchQuery) -> Harvest {
        let mut harvest = Harvest::default();
        self.partition(query.clone(), &self.config.split_order, &mut harvest)
            .await;
        harvest
    }

    fn partition<'s>(
        &'s self,
        query: SearchQuery,
        strategies: &'s [SplitStrategy],
        acc: &'s mut Harvest,
    ) -> BoxFuture<'s, ()> {
        async move {
            acc.partitions += 1;
            let sweep = self.sweep(&query, !strategies.is_empty(), acc).await;
            if !sweep.capped {
                return;
            }

            match strategies.split_first() {
                Some((strategy, rest)) => {
                    info!(
                        "Partition [{}] hit the {} window, splitting by {:?}",
                        query.label(),
                        self.config.window_cap,
                        strategy
                    );
                    self.split(query, *strategy, rest, acc).await
                }
                None => {
                    if sweep.cut_short {
                        self.sweep(&query, false, acc).await;
                    }
                    acc.capped_leaves += 1;
                    warn!(
                        "Partition [{}] is still capped with no split left; keeping the first {} results",
                        query.label(),
                        self.config.window_cap
                    );
                }
            }
        }
        .boxed()
    }

    async fn split(
        &self,
        query: SearchQuery,
        strategy: SplitStrategy,
        rest: &[SplitStrategy],
        acc: &mut Harvest,
    ) {
        let children = match strategy {
            SplitStrategy::Brand => self.brand_children(&query).await,
            SplitStrategy::Alphabet => alphabet_children(&query),
            SplitStrategy::PriceRange => {
                let ranges = self.price_ranges(&query, acc).await;
                if ranges.is_empty() {
                    Vec::new()
                } else {
                    for (lo, hi) in ranges {
                        self.price_partition(&query, lo, hi, rest, acc).await;
                    }
                    return;
                }
            }
        };

        if children.is_empty() {
            debug!(
                "{:?} split produced nothing for [{}], falling through",
                strategy,
                query.label()
            );
            return self.partition(query, rest, acc).await;
        }

        for child in children {
            self.partition(child, rest, acc).await;
        }
    }

    async fn brand_children(&self, query: &SearchQuery) -> Vec<SearchQuery> {
        let facets = match self.backend.facets(query).await {
            Ok(facets) => facets,
            Err(e) => {
                warn!("[{}] brand facets unavailable: {}", query.label(), e);
                return Vec::new();
            }
        };
        debug!("[{}] facets returned {} brands", query.label(), facets.brands.len());
        facets
            .brands
            .iter()
            .filter(|b| b.quantity > 0)
            .filter_map(|b| b.id)
            .map(|id| query.clone().with_filter(format!("B:{}", id)))
            .collect()
    }

    /// Facet ranges when the store publishes them, otherwise `0..top` where
    /// `top` is the dearest product in the partition. An open-ended range
    /// above the highest bound is always appended.
    async fn price_ranges(&self, query: &SearchQuery, acc: &mut Harvest) -> Vec<(f64, f64)> {
        if query.fq.iter().any(|fq| fq.starts_with("P:")) {
            return Vec::new();
        }
        let mut ranges: Vec<(f64, f64)> = match self.backend.facets(query).await {
            Ok(facets) => facets
                .price_ranges
                .iter()
                .filter(|r| r.quantity > 0)
                .filter_map(|r| r.bounds())
                .collect(),
            Err(e) => {
                warn!("[{}] price facets unavailable: {}", query.label(), e);
                Vec::new()
            }
        };
        if ranges.is_empty() {
            let top = self
                .top_price(query, acc)
                .await
                .unwrap_or(self.config.max_price);
            ranges.push((0.0, top));
        }

        let highest = ranges.iter().map(|(_, hi)| *hi).fold(0.0, f64::max);
        if highest < OPEN_PRICE_CEILING {
            ranges.push((highest + 0.01, OPEN_PRICE_CEILING));
        }
        ranges
    }

    async fn top_price(&self, query: &SearchQuery, acc: &mut Harvest) -> Option<f64> {
        let sorted = query.clone().ordered_by(PRICE_DESC);
        match self.backend.search(&sorted, 0, 0).await {
            Ok(page) => {
                acc.requests += 1;
                let top = page.products.first().and_then(Product::top_price)?;
                debug!("[{}] dearest product at {:.2}", query.label(), top);
                Some(top.ceil())
            }
            Err(e) => {
                warn!("[{}] could not read the top price: {}", query.label(), e);
                None
            }
        }
    }

    /// Paginates one `P:[lo TO hi]` range, bisecting while it stays capped.
    fn price_partition<'s>(
        &'s self,
        base: &'s SearchQuery,
        lo: f64,
        hi: f64,
        rest: &'s [SplitStrategy],
        acc: &'s mut Harvest,
    ) -> BoxFuture<'s, ()> {
        async move {
            let query = base.clone().with_filter(price_filter(lo, hi));
            let narrow_enough = hi - lo <= self.config.min_price_width;
            if narrow_enough {
                return self.partition(query, rest, acc).await;
            }

            acc.partitions += 1;
            let sweep = self.sweep(&query, true, acc).await;
            if !sweep.capped {
                return;
            }

            let (left, right) = bisect(lo, hi);
            debug!(
                "Price range {:.2}-{:.2} capped, bisecting at {:.2}",
                lo, hi, left.1
            );
            self.price_partition(base, left.0, left.1, rest, acc).await;
            self.price_partition(base, right.0, right.1, rest, acc).await
        }
        .boxed()
    }

    async fn sweep(
        &self,
        query: &SearchQuery,
        allow_cut_short: bool,
        acc: &mut Harvest,
    ) -> Sweep {
        let step = self.config.step.max(1);
        let cap = self.config.window_cap;
        let mut from = 0;
        let mut empty_streak = 0;
        let mut added_total = 0;

        loop {
            if from >= cap {
                // an empty last page means the listing ended right at the window
                return Sweep {
                    capped: empty_streak == 0,
                    cut_short: false,
                };
            }
            let to = (from + step - 1).min(cap - 1);

            let page = match self.backend.search(query, from, to).await {
                Ok(page) => page,
                Err(VtexError::WindowExceeded { from }) => {
                    debug!("[{}] window refused at offset {}", query.label(), from);
                    return Sweep {
                        capped: true,
                        cut_short: false,
                    };
                }
                Err(e) => {
                    warn!(
                        "[{}] page {}-{} failed, keeping {} products swept so far: {}",
                        query.label(),
                        from,
                        to,
                        added_total,
                        e
                    );
                    acc.record_failure(query, &e);
                    return Sweep {
                        capped: false,
                        cut_short: false,
                    };
                }
            };
            acc.requests += 1;

            let received = page.products.len();
            added_total += acc.absorb(page.products);

            if from == 0 {
                match page.total {
                    Some(0) => break,
                    Some(total) if total > cap && allow_cut_short => {
                        debug!(
                            "[{}] reports {} results, above the {} window",
                            query.label(),
                            total,
                            cap
                        );
                        return Sweep {
                            capped: true,
                            cut_short: true,
                        };
                    }
                    _ => {}
                }
            }

            if page.total.is_some_and(|total| from + received >= total) {
                break;
            }
            if received == 0 {
                empty_streak += 1;
                if empty_streak >= self.config.empty_streak_limit.max(1) {
                    break;
                }
            } else {
                empty_streak = 0;
                if received < to - from + 1 {
                    break;
                }
            }

            from = to + 1;
            if !self.config.page_delay.is_zero() {
                sleep(self.config.page_delay).await;
            }
        }

        debug!(
            "[{}] swept {} new products up to offset {}",
            query.label(),
            added_total,
            from
        );
        Sweep {
            capped: false,
            cut_short: false,
        }
    }
}

fn alphabet_children(query: &SearchQuery) -> Vec<SearchQuery> {
    if query.ft.is_some() {
        return Vec::new();
    }
    ALPHABET
        .iter()
        .map(|ch| query.clone().with_term(*ch))
        .collect()
}

pub fn price_filter(lo: f64, hi: f64) -> String {
    format!("P:[{:.2} TO {:.2}]", lo, hi)
}

/// Splits an inclusive cent range into two disjoint inclusive halves.
fn bisect(lo: f64, hi: f64) -> ((f64, f64), (f64, f64)) {
    let mid = (((lo + hi) / 2.0) * 100.0).floor() / 100.0;
    ((lo, mid), (mid + 0.01, hi))
}
