mod price;

use std::collections::HashSet;

use scraper::Html;
use serde::Serialize;

use crate::vtex::{CommercialOffer, Item, Product, Seller};

pub use price::{effective_price, parse_price, round2, EFFECTIVE_PRICE_SQL};

const NULL_LIKE: &[&str] = &["", "null", "none", "nan", "na", "n/a", "undefined"];
const EAN_REFERENCE_KEYS: &[&str] = &["EAN", "EAN13", "GTIN", "REFID"];

/// One store SKU as captured in a run. This is the unit every sink consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductRow {
    pub ean: Option<String>,
    pub sku: Option<String>,
    pub reference_code: Option<String>,
    pub product_id: Option<String>,
    pub name: String,
    pub brand: Option<String>,
    pub manufacturer: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub list_price: Option<f64>,
    pub offer_price: Option<f64>,
    pub offer_type: Option<String>,
    pub url: Option<String>,
    pub available: Option<bool>,
}

impl ProductRow {
    pub fn effective_price(&self) -> Option<f64> {
        effective_price(self.list_price, self.offer_price)
    }

    /// Store-side identity used when the SKU is missing.
    pub fn record_id(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

/// Trims, decodes entities, drops tags and control characters, collapses
/// whitespace. Null-like placeholders become `None`.
pub fn clean_text(raw: &str) -> Option<String> {
    let decoded = if raw.contains('<') || raw.contains('&') {
        Html::parse_fragment(raw)
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        raw.to_string()
    };

    let collapsed = decoded
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if NULL_LIKE.contains(&collapsed.to_lowercase().as_str()) {
        None
    } else {
        Some(collapsed)
    }
}

pub fn clean_opt(raw: Option<&str>) -> Option<String> {
    raw.and_then(clean_text)
}

/// Digits only, 8 to 14 of them.
pub fn normalize_ean(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit() || c.is_whitespace()) {
        return None;
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    (8..=14).contains(&digits.len()).then_some(digits)
}

pub fn best_ean(item: &Item) -> Option<String> {
    if let Some(ean) = item.ean.as_deref().and_then(normalize_ean) {
        return Some(ean);
    }
    item.reference_id
        .iter()
        .filter(|r| {
            r.key
                .as_deref()
                .map(|k| EAN_REFERENCE_KEYS.contains(&k.trim().to_uppercase().as_str()))
                .unwrap_or(false)
        })
        .find_map(|r| r.value.as_deref().and_then(normalize_ean))
}

/// Internal store code: the `RefId` reference, else the product reference.
pub fn reference_code(product: &Product, item: &Item) -> Option<String> {
    item.reference_id
        .iter()
        .find(|r| r.key.as_deref().map(|k| k.eq_ignore_ascii_case("RefId")).unwrap_or(false))
        .and_then(|r| clean_opt(r.value.as_deref()))
        .or_else(|| clean_opt(product.product_reference.as_deref()))
}

/// Default seller, else the first one with stock, else the first one.
pub fn choose_seller(item: &Item) -> Option<&Seller> {
    item.sellers
        .iter()
        .find(|s| s.seller_default)
        .or_else(|| {
            item.sellers.iter().find(|s| {
                s.offer
                    .as_ref()
                    .and_then(|o| o.is_available)
                    .unwrap_or(false)
            })
        })
        .or_else(|| item.sellers.first())
}

fn teaser_name(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => clean_text(s),
        serde_json::Value::Object(map) => ["Name", "name", "<Name>k__BackingField"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
            .and_then(clean_text),
        _ => None,
    }
}

/// Promotion labels in display order, or `Descuento` for a plain markdown.
pub fn offer_type(offer: &CommercialOffer, list: Option<f64>, price: Option<f64>) -> Option<String> {
    let mut seen = HashSet::new();
    let names: Vec<String> = offer
        .promotion_teasers
        .iter()
        .chain(offer.teasers.iter())
        .chain(offer.discount_highlight.iter())
        .filter_map(teaser_name)
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect();

    if !names.is_empty() {
        return Some(names.join(" | "));
    }

    match (list, price) {
        (Some(l), Some(p)) if p > 0.0 && p < l => Some("Descuento".to_string()),
        _ => None,
    }
}

/// `(categoria, subcategoria)` from the deepest `/A/B/C/` path.
pub fn split_categories(paths: &[String]) -> (Option<String>, Option<String>) {
    let deepest = paths
        .iter()
        .map(|p| {
            p.split('/')
                .filter_map(clean_text)
                .collect::<Vec<_>>()
        })
        .max_by_key(|segments| segments.len());

    match deepest {
        Some(segments) => {
            let mut iter = segments.into_iter();
            (iter.next(), iter.next())
        }
        None => (None, None),
    }
}

pub fn product_url(base_url: &str, product: &Product) -> Option<String> {
    let base = base_url.trim_end_matches('/');
    if let Some(link) = product.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        if link.starts_with("http://") || link.starts_with("https://") {
            return Some(link.to_string());
        }
        if link.starts_with('/') {
            return Some(format!("{}{}", base, link));
        }
    }
    product
        .link_text
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|slug| format!("{}/{}/p", base, slug))
}

/// One row per SKU so each item keeps its own EAN and price.
pub fn rows_from_product(base_url: &str, product: &Product) -> Vec<ProductRow> {
    let (category, subcategory) = split_categories(&product.categories);
    let url = product_url(base_url, product);
    let product_name = clean_opt(product.product_name.as_deref());

    product
        .items
        .iter()
        .filter_map(|item| {
            let name = product_name
                .clone()
                .or_else(|| clean_opt(item.name_complete.as_deref()))
                .or_else(|| clean_opt(item.name.as_deref()))?;

            let offer = choose_seller(item).and_then(|s| s.offer.clone()).unwrap_or_default();
            let price = offer.price.filter(|p| *p > 0.0).map(round2);
            let list = offer
                .list_price
                .filter(|p| *p > 0.0)
                .or(offer.price_without_discount.filter(|p| *p > 0.0))
                .or(price)
                .map(round2);

            Some(ProductRow {
                ean: best_ean(item),
                sku: clean_opt(item.item_id.as_deref()),
                reference_code: reference_code(product, item),
                product_id: clean_opt(product.product_id.as_deref()),
                name,
                brand: clean_opt(product.brand.as_deref()),
                manufacturer: clean_opt(product.manufacturer.as_deref()),
                category: category.clone(),
                subcategory: subcategory.clone(),
                list_price: list,
                offer_price: price,
                offer_type: offer_type(&offer, list, price),
                url: url.clone(),
                available: offer.is_available,
            })
        })
        .collect()
}

/// First row per SKU wins; rows without SKU are keyed by product and URL.
pub fn dedup_rows(rows: Vec<ProductRow>) -> Vec<ProductRow> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let key = match &row.sku {
                Some(sku) => format!("sku:{}", sku),
                None => format!(
                    "pid:{}|{}|{}",
                    row.product_id.as_deref().unwrap_or_default(),
                    row.url.as_deref().unwrap_or_default(),
                    row.name
                ),
            };
            seen.insert(key)
        })
        .collect()
}
