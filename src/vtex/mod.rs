pub mod discovery;
pub mod paginate;
mod types;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::{FetchError, HttpSession};

pub use types::{
    BrandFacet, CategoryNode, CommercialOffer, Facets, Item, PriceRangeFacet, Product,
    ReferenceId, Seller,
};

const SEARCH_PATH: &str = "/api/catalog_system/pub/products/search";
const FACETS_PATH: &str = "/api/catalog_system/pub/facets/search";
const TREE_PATH: &str = "/api/catalog_system/pub/category/tree";

#[derive(Debug, Error)]
pub enum VtexError {
    #[error("search window exceeded at offset {from}")]
    WindowExceeded { from: usize },
    #[error("VTEX request to {url} failed with status {status}: {message}")]
    HttpFailure {
        url: String,
        status: StatusCode,
        message: String,
    },
    #[error("could not decode VTEX payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// One filter set against the search endpoint. Cloned and extended when a
/// partition has to be split.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub fq: Vec<String>,
    pub ft: Option<String>,
    pub sales_channel: Option<u32>,
    pub order_by: Option<String>,
}

impl SearchQuery {
    pub fn new(sales_channel: Option<u32>) -> Self {
        Self {
            sales_channel,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, fq: impl Into<String>) -> Self {
        self.fq.push(fq.into());
        self
    }

    pub fn with_term(mut self, ft: impl Into<String>) -> Self {
        self.ft = Some(ft.into());
        self
    }

    pub fn ordered_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    /// Short human label used in logs.
    pub fn label(&self) -> String {
        let mut parts: Vec<String> = self.fq.clone();
        if let Some(ft) = &self.ft {
            parts.push(format!("ft={}", ft));
        }
        if parts.is_empty() {
            "(all)".to_string()
        } else {
            parts.join(" & ")
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .fq
            .iter()
            .map(|fq| ("fq".to_string(), fq.clone()))
            .collect();
        if let Some(ft) = &self.ft {
            params.push(("ft".to_string(), ft.clone()));
        }
        if let Some(order) = &self.order_by {
            params.push(("O".to_string(), order.clone()));
        }
        if let Some(sc) = self.sales_channel {
            params.push(("sc".to_string(), sc.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub products: Vec<Product>,
    /// Total hits as reported by the `resources` header, when the store sends it.
    pub total: Option<usize>,
}

/// Seam between the pagination engine and the network.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(
        &self,
        query: &SearchQuery,
        from: usize,
        to: usize,
    ) -> Result<SearchPage, VtexError>;

    async fn facets(&self, query: &SearchQuery) -> Result<Facets, VtexError>;
}

#[derive(Clone, Debug)]
pub struct VtexClient {
    http: HttpSession,
    base_url: String,
}

impl VtexClient {
    pub fn new(http: HttpSession, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn category_tree(&self, depth: u32) -> Result<Vec<CategoryNode>, VtexError> {
        let url = format!("{}{}/{}", self.base_url, TREE_PATH, depth);
        let resp = self.http.get(&url, &[]).await?;
        let resp = ensure_success(&url, resp).await?;
        resp.json()
            .await
            .map_err(|source| VtexError::Decode { url, source })
    }

    pub async fn search_by_ean(
        &self,
        ean: &str,
        sales_channel: Option<u32>,
    ) -> Result<Vec<Product>, VtexError> {
        let query = SearchQuery::new(sales_channel).with_filter(format!("alternateIds_Ean:{}", ean));
        let page = self.search(&query, 0, 9).await?;
        Ok(page.products)
    }

    /// True when the base URL answers the search endpoint with a JSON array.
    pub async fn probe(&self) -> bool {
        let url = format!("{}{}", self.base_url, SEARCH_PATH);
        let params = vec![
            ("_from".to_string(), "0".to_string()),
            ("_to".to_string(), "0".to_string()),
            ("ft".to_string(), "a".to_string()),
        ];
        let resp = match self.http.get(&url, &params).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!("VTEX probe against {} failed: {}", self.base_url, e);
                return false;
            }
        };
        if !matches!(resp.status(), StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
            return false;
        }
        matches!(
            resp.json::<serde_json::Value>().await,
            Ok(serde_json::Value::Array(_))
        )
    }
}

#[async_trait]
impl SearchBackend for VtexClient {
    async fn search(
        &self,
        query: &SearchQuery,
        from: usize,
        to: usize,
    ) -> Result<SearchPage, VtexError> {
        let url = format!("{}{}", self.base_url, SEARCH_PATH);
        let mut params = query.params();
        params.push(("_from".to_string(), from.to_string()));
        params.push(("_to".to_string(), to.to_string()));

        let resp = self.http.get(&url, &params).await?;
        let status = resp.status();

        if status == StatusCode::BAD_REQUEST && from > 0 {
            return Err(VtexError::WindowExceeded { from });
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            return Ok(SearchPage::default());
        }

        let total = resp
            .headers()
            .get("resources")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_resources_total);
        let resp = ensure_success(&url, resp).await?;
        let raw: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|source| VtexError::Decode { url, source })?;

        Ok(SearchPage {
            products: decode_products(raw),
            total,
        })
    }

    async fn facets(&self, query: &SearchQuery) -> Result<Facets, VtexError> {
        let url = format!("{}{}", self.base_url, FACETS_PATH);
        let resp = self.http.get(&url, &query.params()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Facets::default());
        }
        let resp = ensure_success(&url, resp).await?;
        resp.json()
            .await
            .map_err(|source| VtexError::Decode { url, source })
    }
}

async fn ensure_success(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, VtexError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(VtexError::HttpFailure {
        url: url.to_string(),
        status,
        message: message.chars().take(300).collect(),
    })
}

/// Decodes a search page product by product; a malformed product is logged
/// and skipped instead of failing the page.
pub fn decode_products(raw: Vec<serde_json::Value>) -> Vec<Product> {
    let mut products = Vec::with_capacity(raw.len());
    for value in raw {
        let id = value
            .get("productId")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        match serde_json::from_value::<Product>(value) {
            Ok(product) => products.push(product),
            Err(e) => warn!("Skipping product {}: {}", id, e),
        }
    }
    products
}

/// `resources: 0-49/3120` -> 3120
pub fn parse_resources_total(value: &str) -> Option<usize> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}
