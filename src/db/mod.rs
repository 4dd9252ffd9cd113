mod schema;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::mysql::{MySqlConnection, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use tracing::{info, warn};

use crate::normalize::{normalize_ean, round2, ProductRow};

pub use schema::{ensure_schema, SchemaLimits, CREATE_TABLES};

const LOCK_WAIT_TIMEOUT: u16 = 1205;
const DEADLOCK: u16 = 1213;
const LOCK_RETRY_ATTEMPTS: u32 = 5;
const LOCK_RETRY_BASE_MS: u64 = 400;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<MySqlPool> {
    MySqlPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .context("Failed to connect to MySQL")
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tienda {
    pub id: i64,
    pub codigo: String,
    pub nombre: String,
    pub ref_tienda: Option<String>,
    pub provincia: Option<String>,
    pub sucursal: Option<String>,
}

/// Product attributes already fitted to the column limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductRecord {
    pub ean: Option<String>,
    pub nombre: Option<String>,
    pub marca: Option<String>,
    pub fabricante: Option<String>,
    pub categoria: Option<String>,
    pub subcategoria: Option<String>,
    pub sku_tienda: Option<String>,
    pub record_id_tienda: Option<String>,
    pub url_tienda: Option<String>,
    pub nombre_tienda: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceRecord {
    pub precio_lista: Option<f64>,
    pub precio_oferta: Option<f64>,
    pub tipo_oferta: Option<String>,
    pub promo_tipo: Option<String>,
    pub promo_texto_regular: Option<String>,
    pub promo_texto_descuento: Option<String>,
    pub promo_comentarios: Option<String>,
}

/// How a store listing is identified inside its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey<'a> {
    Sku(&'a str),
    Record(&'a str),
    Unkeyed,
}

impl ProductRecord {
    /// The record id is only kept when the row has no SKU, so sibling SKUs of
    /// one product never share a key.
    pub fn from_row(row: &ProductRow, limits: &SchemaLimits) -> Self {
        let ean = row.ean.as_deref().and_then(normalize_ean);
        let sku_tienda = limits.fit("producto_tienda", "sku_tienda", row.sku.as_deref());
        let record_id_tienda = match sku_tienda {
            Some(_) => None,
            None => limits.fit("producto_tienda", "record_id_tienda", row.record_id()),
        };
        Self {
            ean: limits.fit("productos", "ean", ean.as_deref()),
            nombre: limits.fit("productos", "nombre", Some(&row.name)),
            marca: limits.fit("productos", "marca", row.brand.as_deref()),
            fabricante: limits.fit("productos", "fabricante", row.manufacturer.as_deref()),
            categoria: limits.fit("productos", "categoria", row.category.as_deref()),
            subcategoria: limits.fit("productos", "subcategoria", row.subcategory.as_deref()),
            sku_tienda,
            record_id_tienda,
            url_tienda: limits.fit("producto_tienda", "url_tienda", row.url.as_deref()),
            nombre_tienda: limits.fit("producto_tienda", "nombre_tienda", Some(&row.name)),
        }
    }

    pub fn store_key(&self) -> StoreKey<'_> {
        match (self.sku_tienda.as_deref(), self.record_id_tienda.as_deref()) {
            (Some(sku), _) => StoreKey::Sku(sku),
            (None, Some(record)) => StoreKey::Record(record),
            (None, None) => StoreKey::Unkeyed,
        }
    }

    /// `(nombre, marca)` for the fallback lookup; both must be present.
    pub fn name_brand_key(&self) -> Option<(&str, &str)> {
        let nombre = self.nombre.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
        let marca = self.marca.as_deref().map(str::trim).filter(|m| !m.is_empty())?;
        Some((nombre, marca))
    }
}

impl PriceRecord {
    pub fn from_row(row: &ProductRow, limits: &SchemaLimits) -> Self {
        let lista = row.list_price.map(round2);
        let oferta = row.offer_price.map(round2);
        let discounted = matches!((lista, oferta), (Some(l), Some(o)) if o > 0.0 && o < l);

        let (regular, descuento) = match (lista, oferta) {
            (Some(l), Some(o)) if discounted => (
                Some(format!("{:.2}", l)),
                Some(format!("{:.0}%", (1.0 - o / l) * 100.0)),
            ),
            _ => (None, None),
        };

        Self {
            precio_lista: lista,
            precio_oferta: oferta,
            tipo_oferta: limits.fit("historico_precios", "tipo_oferta", row.offer_type.as_deref()),
            promo_tipo: if discounted {
                limits.fit("historico_precios", "promo_tipo", row.offer_type.as_deref())
            } else {
                None
            },
            promo_texto_regular: regular,
            promo_texto_descuento: descuento,
            promo_comentarios: None,
        }
    }
}

pub async fn upsert_tienda(conn: &mut MySqlConnection, codigo: &str, nombre: &str) -> Result<i64> {
    sqlx::query(
        "INSERT INTO tiendas (codigo, nombre) VALUES (?, ?) \
         ON DUPLICATE KEY UPDATE nombre = VALUES(nombre)",
    )
    .bind(codigo)
    .bind(nombre)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert tienda")?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM tiendas WHERE codigo = ? LIMIT 1")
        .bind(codigo)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to read tienda id")?;
    Ok(id)
}

/// By EAN first, then by `(nombre, marca)` when both are known. Non-empty
/// incoming attributes refresh the matched product; an EAN already set is
/// never replaced.
pub async fn find_or_create_producto(
    conn: &mut MySqlConnection,
    p: &ProductRecord,
) -> Result<i64, sqlx::Error> {
    if let Some(ean) = &p.ean {
        let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM productos WHERE ean = ? LIMIT 1")
            .bind(ean)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some((id,)) = found {
            sqlx::query(
                "UPDATE productos SET \
                   nombre = COALESCE(NULLIF(?, ''), nombre), \
                   marca = COALESCE(NULLIF(?, ''), marca), \
                   fabricante = COALESCE(NULLIF(?, ''), fabricante), \
                   categoria = COALESCE(NULLIF(?, ''), categoria), \
                   subcategoria = COALESCE(NULLIF(?, ''), subcategoria) \
                 WHERE id = ?",
            )
            .bind(&p.nombre)
            .bind(&p.marca)
            .bind(&p.fabricante)
            .bind(&p.categoria)
            .bind(&p.subcategoria)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            return Ok(id);
        }
    }

    if let Some((nombre, marca)) = p.name_brand_key() {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM productos WHERE nombre = ? AND marca = ? LIMIT 1",
        )
        .bind(nombre)
        .bind(marca)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some((id,)) = found {
            sqlx::query(
                "UPDATE productos SET \
                   ean = COALESCE(ean, NULLIF(?, '')), \
                   fabricante = COALESCE(NULLIF(?, ''), fabricante), \
                   categoria = COALESCE(NULLIF(?, ''), categoria), \
                   subcategoria = COALESCE(NULLIF(?, ''), subcategoria) \
                 WHERE id = ?",
            )
            .bind(&p.ean)
            .bind(&p.fabricante)
            .bind(&p.categoria)
            .bind(&p.subcategoria)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            return Ok(id);
        }
    }

    let result = sqlx::query(
        "INSERT INTO productos (ean, nombre, marca, fabricante, categoria, subcategoria) \
         VALUES (NULLIF(?, ''), ?, NULLIF(?, ''), NULLIF(?, ''), NULLIF(?, ''), NULLIF(?, ''))",
    )
    .bind(&p.ean)
    .bind(p.nombre.as_deref().unwrap_or(""))
    .bind(&p.marca)
    .bind(&p.fabricante)
    .bind(&p.categoria)
    .bind(&p.subcategoria)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_id() as i64)
}

/// Keyed on the store SKU, else on the record id, else a plain insert.
pub async fn upsert_producto_tienda(
    conn: &mut MySqlConnection,
    tienda_id: i64,
    producto_id: i64,
    p: &ProductRecord,
) -> Result<i64, sqlx::Error> {
    let key = p.store_key();
    let sql = match key {
        StoreKey::Sku(_) => {
            "INSERT INTO producto_tienda \
               (tienda_id, producto_id, sku_tienda, record_id_tienda, url_tienda, nombre_tienda) \
             VALUES (?, ?, ?, NULL, ?, ?) \
             ON DUPLICATE KEY UPDATE \
               id = LAST_INSERT_ID(id), \
               producto_id = VALUES(producto_id), \
               url_tienda = COALESCE(VALUES(url_tienda), url_tienda), \
               nombre_tienda = COALESCE(VALUES(nombre_tienda), nombre_tienda)"
        }
        StoreKey::Record(_) => {
            "INSERT INTO producto_tienda \
               (tienda_id, producto_id, sku_tienda, record_id_tienda, url_tienda, nombre_tienda) \
             VALUES (?, ?, NULL, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
               id = LAST_INSERT_ID(id), \
               producto_id = VALUES(producto_id), \
               url_tienda = COALESCE(VALUES(url_tienda), url_tienda), \
               nombre_tienda = COALESCE(VALUES(nombre_tienda), nombre_tienda)"
        }
        StoreKey::Unkeyed => {
            "INSERT INTO producto_tienda \
               (tienda_id, producto_id, sku_tienda, record_id_tienda, url_tienda, nombre_tienda) \
             VALUES (?, ?, NULL, NULL, ?, ?)"
        }
    };

    let mut query = sqlx::query(sql).bind(tienda_id).bind(producto_id);
    match key {
        StoreKey::Sku(sku) => query = query.bind(sku),
        StoreKey::Record(record) => query = query.bind(record),
        StoreKey::Unkeyed => {}
    }
    let result = query
        .bind(&p.url_tienda)
        .bind(&p.nombre_tienda)
        .execute(&mut *conn)
        .await?;

    let id = result.last_insert_id() as i64;
    if id > 0 {
        return Ok(id);
    }

    // LAST_INSERT_ID is not reported back by every server configuration.
    let (sql, value) = match key {
        StoreKey::Sku(sku) => (
            "SELECT id FROM producto_tienda WHERE tienda_id = ? AND sku_tienda = ? LIMIT 1",
            sku,
        ),
        StoreKey::Record(record) => (
            "SELECT id FROM producto_tienda WHERE tienda_id = ? AND record_id_tienda = ? LIMIT 1",
            record,
        ),
        StoreKey::Unkeyed => return Err(sqlx::Error::RowNotFound),
    };
    let found: (i64,) = sqlx::query_as(sql)
        .bind(tienda_id)
        .bind(value)
        .fetch_one(&mut *conn)
        .await?;
    Ok(found.0)
}

/// One snapshot per product-store and capture timestamp; re-runs overwrite it.
pub async fn insert_historico(
    conn: &mut MySqlConnection,
    tienda_id: i64,
    producto_tienda_id: i64,
    capturado_en: NaiveDateTime,
    price: &PriceRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO historico_precios \
           (tienda_id, producto_tienda_id, capturado_en, precio_lista, precio_oferta, tipo_oferta, \
            promo_tipo, promo_texto_regular, promo_texto_descuento, promo_comentarios) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON DUPLICATE KEY UPDATE \
           precio_lista = VALUES(precio_lista), \
           precio_oferta = VALUES(precio_oferta), \
           tipo_oferta = VALUES(tipo_oferta), \
           promo_tipo = VALUES(promo_tipo), \
           promo_texto_regular = VALUES(promo_texto_regular), \
           promo_texto_descuento = VALUES(promo_texto_descuento), \
           promo_comentarios = VALUES(promo_comentarios)",
    )
    .bind(tienda_id)
    .bind(producto_tienda_id)
    .bind(capturado_en)
    .bind(price.precio_lista)
    .bind(price.precio_oferta)
    .bind(&price.tipo_oferta)
    .bind(&price.promo_tipo)
    .bind(&price.promo_texto_regular)
    .bind(&price.promo_texto_descuento)
    .bind(&price.promo_comentarios)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub batches: usize,
    pub lock_retries: usize,
}

fn is_lock_error(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.try_downcast_ref::<MySqlDatabaseError>())
        .map(|e| matches!(e.number(), LOCK_WAIT_TIMEOUT | DEADLOCK))
        .unwrap_or(false)
}

fn lock_backoff(attempt: u32) -> Duration {
    Duration::from_millis(LOCK_RETRY_BASE_MS * 2u64.pow(attempt))
}

async fn persist_batch(
    conn: &mut MySqlConnection,
    tienda_id: i64,
    rows: &[ProductRow],
    capturado_en: NaiveDateTime,
    limits: &SchemaLimits,
) -> Result<(usize, usize), sqlx::Error> {
    let mut inserted = 0;
    let mut skipped = 0;
    for row in rows {
        let product = ProductRecord::from_row(row, limits);
        if product.nombre.is_none() && product.ean.is_none() {
            skipped += 1;
            continue;
        }
        let price = PriceRecord::from_row(row, limits);
        let producto_id = find_or_create_producto(conn, &product).await?;
        let pt_id = upsert_producto_tienda(conn, tienda_id, producto_id, &product).await?;
        insert_historico(conn, tienda_id, pt_id, capturado_en, &price).await?;
        inserted += 1;
    }
    Ok((inserted, skipped))
}

/// Writes one capture run. Each batch is its own transaction; lock timeouts
/// and deadlocks roll the batch back and retry it with exponential backoff,
/// any other error rolls back and aborts.
pub async fn persist_rows(
    pool: &MySqlPool,
    codigo: &str,
    nombre: &str,
    rows: &[ProductRow],
    capturado_en: NaiveDateTime,
    batch_size: usize,
) -> Result<PersistSummary> {
    let mut conn = pool.acquire().await.context("Failed to acquire connection")?;
    let limits = SchemaLimits::load(&mut conn).await?;
    let tienda_id = upsert_tienda(&mut conn, codigo, nombre).await?;
    drop(conn);

    let mut summary = PersistSummary::default();
    let total_batches = rows.len().div_ceil(batch_size.max(1));

    for (idx, batch) in rows.chunks(batch_size.max(1)).enumerate() {
        let mut attempt = 0;
        loop {
            let mut tx = pool.begin().await.context("Failed to open transaction")?;
            match persist_batch(&mut tx, tienda_id, batch, capturado_en, &limits).await {
                Ok((inserted, skipped)) => {
                    tx.commit().await.context("Failed to commit batch")?;
                    summary.inserted += inserted;
                    summary.skipped += skipped;
                    summary.batches += 1;
                    info!(
                        "  Batch {}/{}: {} rows committed",
                        idx + 1,
                        total_batches,
                        inserted
                    );
                    break;
                }
                Err(e) if is_lock_error(&e) && attempt + 1 < LOCK_RETRY_ATTEMPTS => {
                    tx.rollback().await.ok();
                    let delay = lock_backoff(attempt);
                    warn!(
                        "  Batch {}/{} hit a lock ({}), retry {} in {:?}",
                        idx + 1,
                        total_batches,
                        e,
                        attempt + 1,
                        delay
                    );
                    summary.lock_retries += 1;
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(e).with_context(|| {
                        format!("Batch {}/{} rolled back", idx + 1, total_batches)
                    });
                }
            }
        }
    }

    Ok(summary)
}

pub async fn list_tiendas(pool: &MySqlPool) -> Result<Vec<Tienda>> {
    sqlx::query_as::<_, Tienda>(
        "SELECT id, codigo, nombre, ref_tienda, provincia, sucursal FROM tiendas ORDER BY nombre",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list tiendas")
}

/// Sets region fields on a store; `None` leaves a field as it is.
pub async fn assign_region(
    pool: &MySqlPool,
    codigo: &str,
    provincia: Option<&str>,
    sucursal: Option<&str>,
    ref_tienda: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tiendas SET \
           provincia = COALESCE(?, provincia), \
           sucursal = COALESCE(?, sucursal), \
           ref_tienda = COALESCE(?, ref_tienda) \
         WHERE codigo = ?",
    )
    .bind(provincia)
    .bind(sucursal)
    .bind(ref_tienda)
    .bind(codigo)
    .execute(pool)
    .await
    .context("Failed to update tienda region")?;
    Ok(result.rows_affected() > 0)
}
