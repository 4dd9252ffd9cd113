//! Suggests EAN-bearing catalog products for store SKUs whose product has no
//! EAN, and moves confirmed SKUs onto them.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use tracing::info;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const STOP_WORDS: &[&str] = &[
    "de", "la", "el", "los", "las", "con", "para", "por", "sin", "y", "o", "u", "en", "x", "lt",
    "l", "ml", "kg", "gr", "g", "cc",
];

const CHAR_WEIGHT: f64 = 0.60;
const TOKEN_WEIGHT: f64 = 0.25;
pub const DEFAULT_THRESHOLD: f64 = 0.55;

/// Lowercased, accent-free, alphanumeric tokens without stop words or unit
/// tokens.
pub fn normalize_name(value: &str) -> String {
    let folded: String = value
        .trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    folded
        .split_whitespace()
        .filter(|token| !STOP_WORDS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Brand and name folded into one comparable string.
pub fn combo_string(nombre: &str, marca: Option<&str>) -> String {
    let marca = marca.map(normalize_name).unwrap_or_default();
    format!("{} {}", marca, normalize_name(nombre)).trim().to_string()
}

/// Total volume or weight of a listing, with packs multiplied out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizePack {
    pub ml: Option<f64>,
    pub g: Option<f64>,
    pub units: u32,
}

fn size_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(ml|cc|litros?|litro|lts?|l|gramos?|grs?|g|kilos?|kg)\b").ok()
    })
    .as_ref()
}

fn units_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)x\s*(\d+)\b").ok()).as_ref()
}

pub fn parse_size_pack(text: &str) -> SizePack {
    let lower = text.to_lowercase();

    let units = units_regex()
        .and_then(|re| re.captures(&lower))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|u| *u > 0)
        .unwrap_or(1);

    let mut best_ml: f64 = 0.0;
    let mut best_g: f64 = 0.0;
    if let Some(re) = size_regex() {
        for caps in re.captures_iter(&lower) {
            let value = match caps[1].replace(',', ".").parse::<f64>() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match &caps[2] {
                "ml" | "cc" => best_ml = best_ml.max(value),
                "l" | "lt" | "lts" | "litro" | "litros" => best_ml = best_ml.max(value * 1000.0),
                "kg" | "kilo" | "kilos" => best_g = best_g.max(value * 1000.0),
                _ => best_g = best_g.max(value),
            }
        }
    }

    let scale = |best: f64| (best > 0.0).then(|| best * units as f64);
    SizePack {
        ml: scale(best_ml),
        g: scale(best_g),
        units,
    }
}

fn relative_bonus(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() / a.max(b);
    if diff <= 0.2 {
        0.10
    } else if diff <= 0.35 {
        0.05
    } else {
        -0.08
    }
}

pub fn size_bonus(base: &SizePack, dest: &SizePack) -> f64 {
    match (base.ml, base.g, dest.ml, dest.g) {
        (Some(a), _, Some(b), _) => relative_bonus(a, b),
        (_, Some(a), _, Some(b)) => relative_bonus(a, b),
        (Some(_), _, _, Some(_)) | (_, Some(_), Some(_), _) => -0.10,
        _ => 0.0,
    }
}

pub fn brand_bonus(base: Option<&str>, dest: Option<&str>) -> f64 {
    let base = base.map(normalize_name).unwrap_or_default();
    let dest = dest.map(normalize_name).unwrap_or_default();
    if base.is_empty() || dest.is_empty() {
        0.0
    } else if base == dest {
        0.08
    } else if base.contains(&dest) || dest.contains(&base) {
        0.04
    } else {
        -0.03
    }
}

fn token_frequency(input: &str) -> HashMap<String, usize> {
    let mut map = HashMap::new();
    for token in input.split_whitespace() {
        *map.entry(token.to_string()).or_insert(0) += 1;
    }
    map
}

fn char_ngrams(input: &str) -> HashMap<String, usize> {
    let mut map = HashMap::new();
    for word in input.split_whitespace() {
        let padded: Vec<char> = format!(" {} ", word).chars().collect();
        for n in 3..=5 {
            for window in padded.windows(n) {
                *map.entry(window.iter().collect::<String>()).or_insert(0) += 1;
            }
        }
    }
    map
}

fn cosine(left: &HashMap<String, usize>, right: &HashMap<String, usize>) -> f64 {
    let mut dot = 0.0;
    for (token, freq) in left {
        if let Some(freq_right) = right.get(token) {
            dot += (*freq as f64) * (*freq_right as f64);
        }
    }
    let norm = |v: &HashMap<String, usize>| v.values().map(|f| (*f as f64).powi(2)).sum::<f64>().sqrt();
    let (l, r) = (norm(left), norm(right));
    if l == 0.0 || r == 0.0 {
        0.0
    } else {
        dot / (l * r)
    }
}

/// Token cosine similarity of two already normalized strings.
pub fn cosine_similarity(left: &str, right: &str) -> f64 {
    cosine(&token_frequency(left), &token_frequency(right))
}

/// A store SKU whose product carries no EAN.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PendingSku {
    pub pt_id: i64,
    pub tienda: String,
    pub sku_tienda: Option<String>,
    pub nombre_tienda: Option<String>,
    pub producto_id: i64,
    pub producto: String,
    pub marca: Option<String>,
    pub categoria: Option<String>,
}

impl PendingSku {
    fn display_name(&self) -> &str {
        if self.producto.trim().is_empty() {
            self.nombre_tienda.as_deref().unwrap_or_default()
        } else {
            &self.producto
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Candidate {
    pub producto_id: i64,
    pub ean: String,
    pub nombre: String,
    pub marca: Option<String>,
    pub categoria: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub pt_id: i64,
    pub sku_tienda: Option<String>,
    pub nombre_tienda: Option<String>,
    pub marca_base: Option<String>,
    pub destino_producto_id: i64,
    pub ean_destino: String,
    pub nombre_destino: String,
    pub marca_destino: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RankOptions {
    pub top_k: usize,
    pub threshold: f64,
    pub same_brand_only: bool,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            threshold: DEFAULT_THRESHOLD,
            same_brand_only: false,
        }
    }
}

struct Prepared<'a> {
    candidate: &'a Candidate,
    grams: HashMap<String, usize>,
    tokens: HashMap<String, usize>,
    size: SizePack,
}

/// Scores every candidate against every pending SKU and keeps the best
/// `top_k` per SKU at or above the threshold.
pub fn rank_candidates(
    pending: &[PendingSku],
    candidates: &[Candidate],
    options: &RankOptions,
) -> Vec<Suggestion> {
    let prepared: Vec<Prepared<'_>> = candidates
        .iter()
        .map(|c| {
            let combo = combo_string(&c.nombre, c.marca.as_deref());
            Prepared {
                candidate: c,
                grams: char_ngrams(&combo),
                tokens: token_frequency(&combo),
                size: parse_size_pack(&c.nombre),
            }
        })
        .collect();

    let mut out = Vec::new();
    for sku in pending {
        let name = sku.display_name();
        let combo = combo_string(name, sku.marca.as_deref());
        let grams = char_ngrams(&combo);
        let tokens = token_frequency(&combo);
        let size = parse_size_pack(name);
        let brand = sku.marca.as_deref().map(|m| m.trim().to_lowercase());

        let mut scored: Vec<Suggestion> = prepared
            .iter()
            .filter(|p| match (&brand, options.same_brand_only) {
                (Some(b), true) => p.candidate.marca.as_deref().map(|m| m.trim().to_lowercase()).as_ref() == Some(b),
                _ => true,
            })
            .filter_map(|p| {
                let raw = CHAR_WEIGHT * cosine(&grams, &p.grams)
                    + TOKEN_WEIGHT * cosine(&tokens, &p.tokens)
                    + brand_bonus(sku.marca.as_deref(), p.candidate.marca.as_deref())
                    + size_bonus(&size, &p.size);
                let score = (raw.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
                (score >= options.threshold).then(|| Suggestion {
                    pt_id: sku.pt_id,
                    sku_tienda: sku.sku_tienda.clone(),
                    nombre_tienda: sku.nombre_tienda.clone(),
                    marca_base: sku.marca.clone(),
                    destino_producto_id: p.candidate.producto_id,
                    ean_destino: p.candidate.ean.clone(),
                    nombre_destino: p.candidate.nombre.clone(),
                    marca_destino: p.candidate.marca.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(options.top_k);
        out.extend(scored);
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct PendingFilter {
    pub tienda_id: Option<i64>,
    pub marca: Option<String>,
    pub categoria: Option<String>,
    pub query: Option<String>,
    pub limit: i64,
}

pub async fn pending_skus(pool: &MySqlPool, filter: &PendingFilter) -> Result<Vec<PendingSku>> {
    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT pt.id AS pt_id, t.nombre AS tienda, pt.sku_tienda, pt.nombre_tienda, \
                p.id AS producto_id, p.nombre AS producto, p.marca, p.categoria \
         FROM producto_tienda pt \
         JOIN productos p ON p.id = pt.producto_id \
         JOIN tiendas t ON t.id = pt.tienda_id \
         WHERE p.ean IS NULL",
    );
    if let Some(id) = filter.tienda_id {
        qb.push(" AND pt.tienda_id = ").push_bind(id);
    }
    if let Some(marca) = &filter.marca {
        qb.push(" AND p.marca = ").push_bind(marca.clone());
    }
    if let Some(categoria) = &filter.categoria {
        qb.push(" AND p.categoria = ").push_bind(categoria.clone());
    }
    if let Some(q) = filter.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let like = format!("%{}%", q);
        qb.push(" AND (p.nombre LIKE ")
            .push_bind(like.clone())
            .push(" OR pt.nombre_tienda LIKE ")
            .push_bind(like.clone())
            .push(" OR pt.sku_tienda LIKE ")
            .push_bind(like.clone())
            .push(" OR p.marca LIKE ")
            .push_bind(like)
            .push(")");
    }
    qb.push(" ORDER BY t.nombre, pt.nombre_tienda LIMIT ")
        .push_bind(filter.limit.max(1));

    qb.build_query_as::<PendingSku>()
        .fetch_all(pool)
        .await
        .context("Failed to load SKUs without EAN")
}

/// EAN-bearing products, narrowed to the given brands or categories when any
/// are given.
pub async fn candidate_pool(
    pool: &MySqlPool,
    marcas: &[String],
    categorias: &[String],
    limit: i64,
) -> Result<Vec<Candidate>> {
    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT p.id AS producto_id, p.ean, p.nombre, p.marca, p.categoria \
         FROM productos p WHERE p.ean IS NOT NULL",
    );
    if !marcas.is_empty() || !categorias.is_empty() {
        qb.push(" AND (");
        if !marcas.is_empty() {
            qb.push("p.marca IN (");
            let mut sep = qb.separated(", ");
            for m in marcas {
                sep.push_bind(m.clone());
            }
            sep.push_unseparated(")");
        }
        if !categorias.is_empty() {
            if !marcas.is_empty() {
                qb.push(" OR ");
            }
            qb.push("p.categoria IN (");
            let mut sep = qb.separated(", ");
            for c in categorias {
                sep.push_bind(c.clone());
            }
            sep.push_unseparated(")");
        }
        qb.push(")");
    }
    qb.push(" LIMIT ").push_bind(limit.max(1));

    qb.build_query_as::<Candidate>()
        .fetch_all(pool)
        .await
        .context("Failed to load candidate products")
}

/// Points the given store SKUs at another product.
pub async fn reassign(pool: &MySqlPool, pt_ids: &[i64], producto_id: i64) -> Result<u64> {
    if pt_ids.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await.context("Failed to open transaction")?;
    let mut qb = QueryBuilder::<MySql>::new("UPDATE producto_tienda SET producto_id = ");
    qb.push_bind(producto_id).push(" WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in pt_ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");

    let updated = qb
        .build()
        .execute(&mut *tx)
        .await
        .context("Failed to reassign SKUs")?
        .rows_affected();
    tx.commit().await.context("Failed to commit reassignment")?;
    info!("Reassigned {} SKUs to producto {}", updated, producto_id);
    Ok(updated)
}

/// Deletes products that have no EAN and no remaining store SKU.
pub async fn delete_orphans(pool: &MySqlPool, producto_ids: &[i64]) -> Result<u64> {
    if producto_ids.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await.context("Failed to open transaction")?;
    let mut qb = QueryBuilder::<MySql>::new("DELETE FROM productos WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in producto_ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");
    qb.push(
        " AND ean IS NULL \
         AND NOT EXISTS (SELECT 1 FROM producto_tienda pt WHERE pt.producto_id = productos.id)",
    );

    let deleted = qb
        .build()
        .execute(&mut *tx)
        .await
        .context("Failed to delete orphan products")?
        .rows_affected();
    tx.commit().await.context("Failed to commit orphan cleanup")?;
    info!("Deleted {} orphan products", deleted);
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Azúcar  Ledesma x 1 Kg "), "azucar ledesma 1");
        assert_eq!(normalize_name("Leche La Serenísima 1 L"), "leche serenisima 1");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn test_parse_size_pack() {
        let p = parse_size_pack("Gaseosa Cola 1,5 L");
        assert_eq!(p.ml, Some(1500.0));
        assert_eq!(p.g, None);

        let p = parse_size_pack("Cerveza lata 473 ml x 6");
        assert_eq!(p.units, 6);
        assert_eq!(p.ml, Some(2838.0));

        let p = parse_size_pack("Yerba Mate 1 kg");
        assert_eq!(p.g, Some(1000.0));

        let p = parse_size_pack("Galletitas surtidas");
        assert_eq!((p.ml, p.g, p.units), (None, None, 1));
    }

    #[test]
    fn test_size_bonus() {
        let ml = |v| SizePack { ml: Some(v), g: None, units: 1 };
        let g = |v| SizePack { ml: None, g: Some(v), units: 1 };
        let none = SizePack { ml: None, g: None, units: 1 };

        assert_eq!(size_bonus(&ml(1000.0), &ml(900.0)), 0.10);
        assert_eq!(size_bonus(&ml(1000.0), &ml(700.0)), 0.05);
        assert_eq!(size_bonus(&ml(1000.0), &ml(500.0)), -0.08);
        assert_eq!(size_bonus(&g(500.0), &g(500.0)), 0.10);
        assert_eq!(size_bonus(&ml(500.0), &g(500.0)), -0.10);
        assert_eq!(size_bonus(&none, &g(500.0)), 0.0);
    }

    #[test]
    fn test_brand_bonus() {
        assert_eq!(brand_bonus(Some("Arcor"), Some("ARCOR")), 0.08);
        assert_eq!(brand_bonus(Some("Coca Cola"), Some("Coca Cola Zero")), 0.04);
        assert_eq!(brand_bonus(Some("Arcor"), Some("Bagley")), -0.03);
        assert_eq!(brand_bonus(None, Some("Bagley")), 0.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity("yerba mate", "yerba mate") - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity("yerba", "arroz"), 0.0);
        assert_eq!(cosine_similarity("", "arroz"), 0.0);
    }

    #[test]
    fn test_rank_candidates_prefers_same_product() {
        let pending = vec![PendingSku {
            pt_id: 10,
            tienda: "Vea".into(),
            sku_tienda: Some("A1".into()),
            nombre_tienda: Some("Yerba Mate Playadito 1 Kg".into()),
            producto_id: 5,
            producto: "Yerba Mate Playadito 1 Kg".into(),
            marca: Some("Playadito".into()),
            categoria: Some("Almacén".into()),
        }];
        let candidates = vec![
            Candidate {
                producto_id: 1,
                ean: "7790000000011".into(),
                nombre: "Yerba Mate Playadito 1kg".into(),
                marca: Some("Playadito".into()),
                categoria: None,
            },
            Candidate {
                producto_id: 2,
                ean: "7790000000028".into(),
                nombre: "Yerba Mate Playadito 500 g".into(),
                marca: Some("Playadito".into()),
                categoria: None,
            },
            Candidate {
                producto_id: 3,
                ean: "7790000000035".into(),
                nombre: "Arroz Gallo Oro 1 kg".into(),
                marca: Some("Gallo".into()),
                categoria: None,
            },
        ];

        let options = RankOptions {
            top_k: 2,
            threshold: 0.0,
            same_brand_only: false,
        };
        let ranked = rank_candidates(&pending, &candidates, &options);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].destino_producto_id, 1);
        assert!(ranked[0].score > ranked[1].score);

        let strict = RankOptions {
            same_brand_only: true,
            threshold: 0.0,
            top_k: 5,
        };
        let ranked = rank_candidates(&pending, &candidates, &strict);
        assert!(ranked.iter().all(|s| s.destino_producto_id != 3));
    }
}
