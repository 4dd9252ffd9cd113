use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::MySqlConnection;
use tracing::{debug, info};

pub const CREATE_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tiendas (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        codigo VARCHAR(255) NOT NULL,
        nombre VARCHAR(255) NOT NULL,
        ref_tienda VARCHAR(255) NULL,
        provincia VARCHAR(120) NULL,
        sucursal VARCHAR(255) NULL,
        UNIQUE KEY uk_tiendas_codigo (codigo)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
    r#"CREATE TABLE IF NOT EXISTS productos (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        ean VARCHAR(14) NULL,
        nombre VARCHAR(255) NOT NULL,
        marca VARCHAR(120) NULL,
        fabricante VARCHAR(255) NULL,
        categoria VARCHAR(120) NULL,
        subcategoria VARCHAR(200) NULL,
        UNIQUE KEY uk_productos_ean (ean),
        KEY idx_productos_nombre_marca (nombre, marca)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
    r#"CREATE TABLE IF NOT EXISTS producto_tienda (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        tienda_id BIGINT NOT NULL,
        producto_id BIGINT NOT NULL,
        sku_tienda VARCHAR(120) NULL,
        record_id_tienda VARCHAR(512) NULL,
        url_tienda VARCHAR(512) NULL,
        nombre_tienda VARCHAR(255) NULL,
        UNIQUE KEY uk_pt_sku (tienda_id, sku_tienda),
        UNIQUE KEY uk_pt_record (tienda_id, record_id_tienda),
        KEY idx_pt_producto (producto_id),
        CONSTRAINT fk_pt_tienda FOREIGN KEY (tienda_id) REFERENCES tiendas (id),
        CONSTRAINT fk_pt_producto FOREIGN KEY (producto_id) REFERENCES productos (id)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
    r#"CREATE TABLE IF NOT EXISTS historico_precios (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        tienda_id BIGINT NOT NULL,
        producto_tienda_id BIGINT NOT NULL,
        capturado_en DATETIME NOT NULL,
        precio_lista DECIMAL(12,2) NULL,
        precio_oferta DECIMAL(12,2) NULL,
        tipo_oferta VARCHAR(255) NULL,
        promo_tipo VARCHAR(255) NULL,
        promo_texto_regular VARCHAR(255) NULL,
        promo_texto_descuento VARCHAR(255) NULL,
        promo_comentarios VARCHAR(500) NULL,
        UNIQUE KEY uk_hp_pt_fecha (producto_tienda_id, capturado_en),
        KEY idx_hp_tienda_fecha (tienda_id, capturado_en),
        CONSTRAINT fk_hp_tienda FOREIGN KEY (tienda_id) REFERENCES tiendas (id),
        CONSTRAINT fk_hp_pt FOREIGN KEY (producto_tienda_id) REFERENCES producto_tienda (id)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
];

pub async fn ensure_schema(conn: &mut MySqlConnection) -> Result<()> {
    for ddl in CREATE_TABLES {
        sqlx::query(ddl)
            .execute(&mut *conn)
            .await
            .context("Failed to create table")?;
    }
    info!("Schema ready ({} tables)", CREATE_TABLES.len());
    Ok(())
}

/// Identity columns: oversized values are dropped, never truncated.
const IDENTITY_COLUMNS: &[(&str, &str)] = &[
    ("productos", "ean"),
    ("tiendas", "codigo"),
    ("producto_tienda", "sku_tienda"),
    ("producto_tienda", "record_id_tienda"),
    ("producto_tienda", "url_tienda"),
];

#[derive(Debug, Clone, Default)]
pub struct SchemaLimits {
    limits: HashMap<(String, String), usize>,
}

impl SchemaLimits {
    pub async fn load(conn: &mut MySqlConnection) -> Result<Self> {
        let rows: Vec<(String, String, Option<i64>)> = sqlx::query_as(
            "SELECT CAST(TABLE_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR), \
                    CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() \
               AND TABLE_NAME IN ('tiendas', 'productos', 'producto_tienda', 'historico_precios')",
        )
        .fetch_all(&mut *conn)
        .await
        .context("Failed to read column limits")?;

        let limits: HashMap<(String, String), usize> = rows
            .into_iter()
            .filter_map(|(table, column, max)| {
                let max = usize::try_from(max?).ok()?;
                Some(((table.to_lowercase(), column.to_lowercase()), max))
            })
            .collect();
        debug!("Loaded {} column limits", limits.len());
        Ok(Self { limits })
    }

    pub fn from_pairs(pairs: &[(&str, &str, usize)]) -> Self {
        Self {
            limits: pairs
                .iter()
                .map(|(t, c, n)| ((t.to_string(), c.to_string()), *n))
                .collect(),
        }
    }

    pub fn max_len(&self, table: &str, column: &str) -> Option<usize> {
        self.limits
            .get(&(table.to_string(), column.to_string()))
            .copied()
    }

    /// Fits a value to its column: identities that do not fit are dropped,
    /// descriptive text is cut at the limit (counted in characters).
    pub fn fit(&self, table: &str, column: &str, value: Option<&str>) -> Option<String> {
        let value = value?.trim();
        if value.is_empty() {
            return None;
        }
        let max = match self.max_len(table, column) {
            Some(max) => max,
            None => return Some(value.to_string()),
        };
        if value.chars().count() <= max {
            return Some(value.to_string());
        }
        if IDENTITY_COLUMNS.iter().any(|(t, c)| *t == table && *c == column) {
            debug!("Dropping {}.{}: {} chars over {}", table, column, value.chars().count(), max);
            None
        } else {
            Some(value.chars().take(max).collect())
        }
    }
}
