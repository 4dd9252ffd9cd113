use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{MySql, MySqlPool, QueryBuilder};

use crate::normalize::{round2, EFFECTIVE_PRICE_SQL};

/// Filters shared by every report. The EAN list is the basket under study;
/// an empty list yields empty results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportFilter {
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub tienda_ids: Vec<i64>,
    #[serde(default)]
    pub categorias: Vec<String>,
    #[serde(default)]
    pub subcategorias: Vec<String>,
    #[serde(default)]
    pub marcas: Vec<String>,
    #[serde(default)]
    pub eans: Vec<String>,
}

impl ReportFilter {
    pub fn new(start: NaiveDate, end: NaiveDate, eans: Vec<String>) -> Self {
        Self {
            start,
            end,
            eans,
            ..Self::default()
        }
    }

    /// Requested EANs, trimmed, blanks dropped.
    pub fn requested_eans(&self) -> Vec<String> {
        self.eans
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn has_eans(&self) -> bool {
        self.eans.iter().any(|e| !e.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.has_eans() {
            return Err("at least one EAN is required".to_string());
        }
        if self.start > self.end {
            return Err(format!("start {} is after end {}", self.start, self.end));
        }
        Ok(())
    }

    /// Appends the filter conditions to a query whose tables are aliased
    /// `h` (historico_precios) and `p` (productos).
    fn push_conditions(&self, qb: &mut QueryBuilder<'_, MySql>) {
        qb.push(" h.capturado_en >= ")
            .push_bind(self.start)
            .push(" AND h.capturado_en < ")
            .push_bind(self.end)
            .push(" + INTERVAL 1 DAY");

        push_in(qb, "h.tienda_id", &self.tienda_ids);
        push_in(qb, "p.categoria", &self.categorias);
        push_in(qb, "p.subcategoria", &self.subcategorias);
        push_in(qb, "p.marca", &self.marcas);
        push_in(qb, "p.ean", &self.requested_eans());
    }
}

fn push_in<'a, T>(qb: &mut QueryBuilder<'a, MySql>, column: &str, values: &[T])
where
    T: 'a + Clone + Send + sqlx::Encode<'a, MySql> + sqlx::Type<MySql>,
{
    if values.is_empty() {
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    separated.push_unseparated(")");
}

fn price_expr(effective: bool) -> &'static str {
    if effective {
        EFFECTIVE_PRICE_SQL
    } else {
        "h.precio_lista"
    }
}

/// Latest snapshot per product-store for each day in range.
fn push_daily_latest_cte(qb: &mut QueryBuilder<'_, MySql>, filter: &ReportFilter) {
    qb.push(
        "WITH ult AS ( \
           SELECT DATE(h.capturado_en) AS d, h.tienda_id, h.producto_tienda_id, \
                  MAX(h.capturado_en) AS maxc \
           FROM historico_precios h \
           JOIN producto_tienda pt ON pt.id = h.producto_tienda_id \
           JOIN productos p ON p.id = pt.producto_id \
           WHERE",
    );
    filter.push_conditions(qb);
    qb.push(" GROUP BY DATE(h.capturado_en), h.tienda_id, h.producto_tienda_id) ");
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DailyAverage {
    pub dia: NaiveDate,
    pub tienda: String,
    pub precio_promedio: Option<f64>,
}

pub async fn daily_averages(
    pool: &MySqlPool,
    filter: &ReportFilter,
    effective: bool,
) -> Result<Vec<DailyAverage>> {
    if !filter.has_eans() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<MySql>::new("");
    push_daily_latest_cte(&mut qb, filter);
    qb.push("SELECT u.d AS dia, t.nombre AS tienda, CAST(AVG(")
        .push(price_expr(effective))
        .push(
            ") AS DOUBLE) AS precio_promedio \
             FROM ult u \
             JOIN historico_precios h ON h.producto_tienda_id = u.producto_tienda_id \
                                     AND h.capturado_en = u.maxc \
             JOIN tiendas t ON t.id = u.tienda_id \
             GROUP BY u.d, t.nombre \
             ORDER BY u.d, t.nombre",
        );

    qb.build_query_as::<DailyAverage>()
        .fetch_all(pool)
        .await
        .context("Failed to compute daily averages")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct Kpis {
    pub observaciones: i64,
    pub productos_distintos: i64,
    pub precio_medio: Option<f64>,
    pub share_oferta: Option<f64>,
    pub descuento_promedio: Option<f64>,
}

pub async fn kpis(pool: &MySqlPool, filter: &ReportFilter) -> Result<Kpis> {
    if !filter.has_eans() {
        return Ok(Kpis::default());
    }
    let mut qb = QueryBuilder::<MySql>::new("");
    push_daily_latest_cte(&mut qb, filter);
    qb.push(
        ", snap AS ( \
           SELECT u.producto_tienda_id, h.precio_lista, h.precio_oferta, ",
    )
    .push(EFFECTIVE_PRICE_SQL)
    .push(
        " AS precio_efectivo, \
             (h.precio_oferta IS NOT NULL AND h.precio_oferta > 0 \
              AND h.precio_lista IS NOT NULL AND h.precio_oferta < h.precio_lista) AS en_oferta \
           FROM ult u \
           JOIN historico_precios h ON h.producto_tienda_id = u.producto_tienda_id \
                                   AND h.capturado_en = u.maxc) \
         SELECT COUNT(*) AS observaciones, \
                COUNT(DISTINCT producto_tienda_id) AS productos_distintos, \
                CAST(AVG(precio_efectivo) AS DOUBLE) AS precio_medio, \
                CAST(AVG(CASE WHEN en_oferta THEN 1 ELSE 0 END) AS DOUBLE) AS share_oferta, \
                CAST(AVG(CASE WHEN en_oferta AND precio_lista > 0 \
                    THEN (precio_lista - precio_oferta) / precio_lista END) AS DOUBLE) \
                    AS descuento_promedio \
         FROM snap",
    );

    qb.build_query_as::<Kpis>()
        .fetch_one(pool)
        .await
        .context("Failed to compute KPIs")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BasketLine {
    pub tienda: String,
    pub ean: String,
    pub producto: Option<String>,
    pub precio: Option<f64>,
}

/// Latest price per (store, EAN) inside the date range; ties on the capture
/// time keep the cheaper SKU.
pub async fn basket(
    pool: &MySqlPool,
    filter: &ReportFilter,
    effective: bool,
) -> Result<Vec<BasketLine>> {
    if !filter.has_eans() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<MySql>::new(
        "WITH ult AS ( \
           SELECT h.tienda_id, h.producto_tienda_id, MAX(h.capturado_en) AS maxc \
           FROM historico_precios h \
           JOIN producto_tienda pt ON pt.id = h.producto_tienda_id \
           JOIN productos p ON p.id = pt.producto_id \
           WHERE",
    );
    filter.push_conditions(&mut qb);
    qb.push(
        " GROUP BY h.tienda_id, h.producto_tienda_id), \
         snap AS ( \
           SELECT h.tienda_id, p.ean, COALESCE(pt.nombre_tienda, p.nombre) AS producto, ",
    )
    .push(price_expr(effective))
    .push(
        " AS precio, h.capturado_en \
           FROM ult u \
           JOIN historico_precios h ON h.producto_tienda_id = u.producto_tienda_id \
                                   AND h.capturado_en = u.maxc \
           JOIN producto_tienda pt ON pt.id = u.producto_tienda_id \
           JOIN productos p ON p.id = pt.producto_id), \
         dedup AS ( \
           SELECT s.*, ROW_NUMBER() OVER ( \
             PARTITION BY s.tienda_id, s.ean ORDER BY s.capturado_en DESC, s.precio ASC) AS rn \
           FROM snap s) \
         SELECT t.nombre AS tienda, d.ean, d.producto, CAST(d.precio AS DOUBLE) AS precio \
         FROM dedup d \
         JOIN tiendas t ON t.id = d.tienda_id \
         WHERE d.rn = 1 \
         ORDER BY t.nombre, d.ean",
    );

    qb.build_query_as::<BasketLine>()
        .fetch_all(pool)
        .await
        .context("Failed to load basket")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreBasket {
    pub tienda: String,
    pub total: f64,
    pub found: usize,
    pub coverage: f64,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasketComparison {
    pub requested: usize,
    /// Fullest baskets first, then cheapest.
    pub stores: Vec<StoreBasket>,
    pub cheapest_complete: Option<String>,
}

impl BasketComparison {
    pub fn from_lines(lines: &[BasketLine], eans: &[String]) -> Self {
        let requested: Vec<&str> = {
            let mut seen = HashSet::new();
            eans.iter()
                .map(|e| e.trim())
                .filter(|e| !e.is_empty() && seen.insert(*e))
                .collect()
        };

        let mut per_store: BTreeMap<&str, HashMap<&str, f64>> = BTreeMap::new();
        for line in lines {
            let prices = per_store.entry(line.tienda.as_str()).or_default();
            if let Some(precio) = line.precio.filter(|p| *p > 0.0) {
                prices
                    .entry(line.ean.as_str())
                    .and_modify(|p| *p = p.min(precio))
                    .or_insert(precio);
            }
        }

        let mut stores: Vec<StoreBasket> = per_store
            .into_iter()
            .map(|(tienda, prices)| {
                let mut total = 0.0;
                let mut missing = Vec::new();
                for ean in &requested {
                    match prices.get(ean) {
                        Some(p) => total += p,
                        None => missing.push(ean.to_string()),
                    }
                }
                let found = requested.len() - missing.len();
                let coverage = if requested.is_empty() {
                    0.0
                } else {
                    found as f64 / requested.len() as f64
                };
                StoreBasket {
                    tienda: tienda.to_string(),
                    total: round2(total),
                    found,
                    coverage,
                    missing,
                }
            })
            .collect();

        stores.sort_by(|a, b| {
            b.found
                .cmp(&a.found)
                .then(a.total.total_cmp(&b.total))
                .then(a.tienda.cmp(&b.tienda))
        });

        let cheapest_complete = stores
            .iter()
            .filter(|s| !requested.is_empty() && s.missing.is_empty())
            .min_by(|a, b| a.total.total_cmp(&b.total))
            .map(|s| s.tienda.clone());

        Self {
            requested: requested.len(),
            stores,
            cheapest_complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DetailRow {
    pub ean: Option<String>,
    pub cod: Option<String>,
    pub producto: Option<String>,
    pub categoria: Option<String>,
    pub subcategoria: Option<String>,
    pub fabricante: Option<String>,
    pub marca: Option<String>,
    pub precio_lista: Option<f64>,
    pub precio_oferta: Option<f64>,
    pub tipo_oferta: Option<String>,
    pub fecha: NaiveDate,
    pub id_bandera: Option<String>,
    pub bandera: String,
    pub url: Option<String>,
}

/// Capture-level rows. The offer is blanked when it only restates the list
/// price or is typed as a regular price.
pub async fn detail(pool: &MySqlPool, filter: &ReportFilter, limit: i64) -> Result<Vec<DetailRow>> {
    if !filter.has_eans() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT p.ean, pt.sku_tienda AS cod, \
                COALESCE(pt.nombre_tienda, p.nombre) AS producto, \
                p.categoria, p.subcategoria, p.fabricante, p.marca, \
                CAST(h.precio_lista AS DOUBLE) AS precio_lista, \
                CAST(CASE \
                  WHEN h.precio_oferta IS NULL THEN NULL \
                  WHEN h.precio_lista IS NULL THEN h.precio_oferta \
                  WHEN (h.tipo_oferta IS NULL AND h.precio_oferta = h.precio_lista) \
                    OR h.tipo_oferta LIKE '%Precio regular%' THEN NULL \
                  ELSE h.precio_oferta END AS DOUBLE) AS precio_oferta, \
                CASE WHEN h.tipo_oferta LIKE '%Precio%regular%' THEN NULL \
                  ELSE h.tipo_oferta END AS tipo_oferta, \
                DATE(h.capturado_en) AS fecha, \
                t.ref_tienda AS id_bandera, t.nombre AS bandera, pt.url_tienda AS url \
         FROM historico_precios h \
         JOIN producto_tienda pt ON pt.id = h.producto_tienda_id \
         JOIN productos p ON p.id = pt.producto_id \
         JOIN tiendas t ON t.id = h.tienda_id \
         WHERE",
    );
    filter.push_conditions(&mut qb);
    qb.push(
        " AND h.precio_lista IS NOT NULL AND h.precio_lista <> 0 \
         ORDER BY t.nombre, p.ean, h.capturado_en LIMIT ",
    )
    .push_bind(limit.max(1));

    qb.build_query_as::<DetailRow>()
        .fetch_all(pool)
        .await
        .context("Failed to load report detail")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(tienda: &str, ean: &str, precio: Option<f64>) -> BasketLine {
        BasketLine {
            tienda: tienda.to_string(),
            ean: ean.to_string(),
            producto: None,
            precio,
        }
    }

    fn eans() -> Vec<String> {
        vec!["111".into(), "222".into(), "333".into()]
    }

    #[test]
    fn test_basket_comparison_totals_and_coverage() {
        let lines = vec![
            line("Disco", "111", Some(100.0)),
            line("Disco", "222", Some(200.0)),
            line("Disco", "333", Some(300.0)),
            line("Vea", "111", Some(90.0)),
            line("Vea", "222", Some(190.0)),
            line("Vea", "333", Some(290.0)),
            line("Dia", "111", Some(10.0)),
        ];
        let cmp = BasketComparison::from_lines(&lines, &eans());

        assert_eq!(cmp.requested, 3);
        assert_eq!(cmp.stores[0].tienda, "Vea");
        assert_eq!(cmp.stores[0].total, 570.0);
        assert_eq!(cmp.stores[1].tienda, "Disco");
        assert_eq!(cmp.cheapest_complete.as_deref(), Some("Vea"));

        let dia = cmp.stores.iter().find(|s| s.tienda == "Dia").unwrap();
        assert_eq!(dia.found, 1);
        assert_eq!(dia.missing, vec!["222".to_string(), "333".to_string()]);
        assert!((dia.coverage - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_basket_comparison_ignores_missing_prices_and_duplicates() {
        let lines = vec![
            line("Disco", "111", None),
            line("Disco", "222", Some(50.0)),
            line("Disco", "222", Some(40.0)),
        ];
        let mut requested = eans();
        requested.push("222".into());
        let cmp = BasketComparison::from_lines(&lines, &requested);

        assert_eq!(cmp.requested, 3);
        assert_eq!(cmp.stores[0].total, 40.0);
        assert_eq!(cmp.stores[0].missing, vec!["111".to_string(), "333".to_string()]);
        assert!(cmp.cheapest_complete.is_none());
    }

    #[test]
    fn test_filter_validation() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert!(ReportFilter::new(d("2025-01-01"), d("2025-01-31"), vec!["1".into()])
            .validate()
            .is_ok());
        assert!(ReportFilter::new(d("2025-01-01"), d("2025-01-31"), vec![" ".into()])
            .validate()
            .is_err());
        assert!(ReportFilter::new(d("2025-02-01"), d("2025-01-31"), vec!["1".into()])
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_blank_eans_never_reach_the_database() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let filter = ReportFilter::new(d("2025-01-01"), d("2025-01-31"), vec!["  ".into(), "".into()]);
        assert!(!filter.has_eans());
        assert!(filter.requested_eans().is_empty());

        // nothing listens on this port; any query would fail
        let pool = MySqlPool::connect_lazy("mysql://root@127.0.0.1:1/none").unwrap();
        assert!(basket(&pool, &filter, true).await.unwrap().is_empty());
        assert!(daily_averages(&pool, &filter, true).await.unwrap().is_empty());
        assert!(detail(&pool, &filter, 10).await.unwrap().is_empty());
        assert_eq!(kpis(&pool, &filter).await.unwrap().observaciones, 0);
    }

    #[test]
    fn test_filter_conditions_bind_every_list() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let filter = ReportFilter {
            tienda_ids: vec![1, 2],
            marcas: vec!["Arcor".into()],
            ..ReportFilter::new(d("2025-01-01"), d("2025-01-31"), vec!["111".into()])
        };
        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM x WHERE");
        filter.push_conditions(&mut qb);
        let sql = qb.sql();
        assert!(sql.contains("h.tienda_id IN (?, ?)"));
        assert!(sql.contains("p.marca IN (?)"));
        assert!(sql.contains("p.ean IN (?)"));
        assert!(!sql.contains("p.categoria"));
    }
}
