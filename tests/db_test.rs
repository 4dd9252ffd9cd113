// Persistence against a real MySQL server. Ignored by default; run with
//   DATABASE_URL=mysql://root@localhost:3306/precios_test cargo test -- --ignored
// Every test works under its own store codes and EANs so runs do not collide.

use chrono::{NaiveDate, NaiveDateTime};
use precios_cli::db::{self, persist_rows};
use precios_cli::normalize::ProductRow;
use sqlx::mysql::MySqlPool;
use uuid::Uuid;

async fn pool() -> MySqlPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    let pool = db::connect(&url, 2).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    db::ensure_schema(&mut conn).await.unwrap();
    pool
}

fn tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn unique_ean() -> String {
    format!("{:013}", Uuid::new_v4().as_u128() % 10_000_000_000_000)
}

fn captured(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, day)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

fn row(ean: Option<&str>, sku: Option<&str>, name: &str, price: f64, url: &str) -> ProductRow {
    ProductRow {
        ean: ean.map(str::to_string),
        sku: sku.map(str::to_string),
        name: name.to_string(),
        list_price: Some(price),
        offer_price: Some(price),
        url: Some(url.to_string()),
        ..ProductRow::default()
    }
}

async fn tienda_id(pool: &MySqlPool, codigo: &str) -> i64 {
    sqlx::query_scalar("SELECT id FROM tiendas WHERE codigo = ?")
        .bind(codigo)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn count(pool: &MySqlPool, sql: &str, id: i64) -> i64 {
    sqlx::query_scalar(sql).bind(id).fetch_one(pool).await.unwrap()
}

#[tokio::test]
#[ignore]
async fn test_rerun_of_same_capture_overwrites_snapshot() {
    let pool = pool().await;
    let codigo = format!("t_{}", tag());
    let ean = unique_ean();
    let at = captured(3);

    let first = vec![row(Some(&ean), Some("A1"), "Yerba 1 kg", 4000.0, "https://x.com/yerba/p")];
    persist_rows(&pool, &codigo, "Tienda", &first, at, 50).await.unwrap();
    let second = vec![row(Some(&ean), Some("A1"), "Yerba 1 kg", 3500.0, "https://x.com/yerba/p")];
    persist_rows(&pool, &codigo, "Tienda", &second, at, 50).await.unwrap();

    let tid = tienda_id(&pool, &codigo).await;
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM historico_precios WHERE tienda_id = ?", tid).await,
        1
    );
    let price: f64 = sqlx::query_scalar(
        "SELECT CAST(precio_lista AS DOUBLE) FROM historico_precios WHERE tienda_id = ?",
    )
    .bind(tid)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(price, 3500.0);

    // a new capture timestamp is a new snapshot
    persist_rows(&pool, &codigo, "Tienda", &second, captured(4), 50).await.unwrap();
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM historico_precios WHERE tienda_id = ?", tid).await,
        2
    );
}

#[tokio::test]
#[ignore]
async fn test_ean_links_stores_to_one_product() {
    let pool = pool().await;
    let (a, b) = (format!("a_{}", tag()), format!("b_{}", tag()));
    let ean = unique_ean();

    let in_a = vec![row(Some(&ean), Some("1"), "Aceite Natura 1.5 L", 2899.0, "https://a.com/aceite/p")];
    let in_b = vec![row(Some(&ean), Some("77"), "ACEITE NATURA GIRASOL 1,5L", 2950.0, "https://b.com/aceite/p")];
    persist_rows(&pool, &a, "A", &in_a, captured(5), 50).await.unwrap();
    persist_rows(&pool, &b, "B", &in_b, captured(5), 50).await.unwrap();

    let productos: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT pt.producto_id FROM producto_tienda pt \
         JOIN productos p ON p.id = pt.producto_id WHERE p.ean = ?",
    )
    .bind(&ean)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(productos.len(), 1);

    let name: String = sqlx::query_scalar("SELECT nombre FROM productos WHERE ean = ?")
        .bind(&ean)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(name, "ACEITE NATURA GIRASOL 1,5L");
}

#[tokio::test]
#[ignore]
async fn test_sibling_skus_of_one_product_page_are_kept_apart() {
    let pool = pool().await;
    let codigo = format!("t_{}", tag());
    let url = "https://x.com/gaseosa/p";
    let rows = vec![
        row(Some(&unique_ean()), Some("1001"), "Gaseosa Cola 1.5 L", 1800.0, url),
        row(Some(&unique_ean()), Some("1002"), "Gaseosa Cola 2.25 L", 2400.0, url),
    ];

    let summary = persist_rows(&pool, &codigo, "Tienda", &rows, captured(6), 50).await.unwrap();
    assert_eq!(summary.inserted, 2);

    let tid = tienda_id(&pool, &codigo).await;
    let skus: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT sku_tienda, record_id_tienda, url_tienda FROM producto_tienda \
         WHERE tienda_id = ? ORDER BY sku_tienda",
    )
    .bind(tid)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(skus.len(), 2);
    assert_eq!(skus[0].0, "1001");
    assert_eq!(skus[1].0, "1002");
    assert!(skus.iter().all(|(_, record, u)| record.is_none() && u.as_deref() == Some(url)));
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM historico_precios WHERE tienda_id = ?", tid).await,
        2
    );
}

#[tokio::test]
#[ignore]
async fn test_record_id_keys_rows_without_sku() {
    let pool = pool().await;
    let codigo = format!("t_{}", tag());
    let rows = vec![row(None, None, &format!("Pan casero {}", tag()), 900.0, "https://x.com/pan")];

    persist_rows(&pool, &codigo, "Tienda", &rows, captured(7), 50).await.unwrap();
    persist_rows(&pool, &codigo, "Tienda", &rows, captured(8), 50).await.unwrap();

    let tid = tienda_id(&pool, &codigo).await;
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM producto_tienda WHERE tienda_id = ?", tid).await,
        1
    );
    let record: Option<String> =
        sqlx::query_scalar("SELECT record_id_tienda FROM producto_tienda WHERE tienda_id = ?")
            .bind(tid)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(record.as_deref(), Some("https://x.com/pan"));
}

#[tokio::test]
#[ignore]
async fn test_unbranded_names_do_not_merge_products() {
    let pool = pool().await;
    let (a, b) = (format!("a_{}", tag()), format!("b_{}", tag()));
    let name = format!("Milanesa de soja {}", tag());

    let in_a = vec![row(None, Some("9"), &name, 1500.0, "https://a.com/m")];
    let in_b = vec![row(None, Some("9"), &name, 1600.0, "https://b.com/m")];
    persist_rows(&pool, &a, "A", &in_a, captured(9), 50).await.unwrap();
    persist_rows(&pool, &b, "B", &in_b, captured(9), 50).await.unwrap();

    let productos: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM productos WHERE nombre = ?")
        .bind(&name)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(productos, 2);
}

#[tokio::test]
#[ignore]
async fn test_failing_batch_rolls_back_and_aborts() {
    let pool = pool().await;
    let codigo = format!("t_{}", tag());
    let rows = vec![
        row(Some(&unique_ean()), Some("1"), "Arroz 1 kg", 1200.0, "https://x.com/arroz/p"),
        row(Some(&unique_ean()), Some("2"), "Fideos 500 g", 900.0, "https://x.com/fideos/p"),
        row(Some(&unique_ean()), Some("3"), "Harina 1 kg", 800.0, "https://x.com/harina/p"),
        // out of range for DECIMAL(12,2) under the default strict sql_mode
        row(Some(&unique_ean()), Some("4"), "Caviar", 1e11, "https://x.com/caviar/p"),
    ];

    let result = persist_rows(&pool, &codigo, "Tienda", &rows, captured(10), 2).await;
    assert!(result.is_err());

    let tid = tienda_id(&pool, &codigo).await;
    let skus: Vec<String> = sqlx::query_scalar(
        "SELECT sku_tienda FROM producto_tienda WHERE tienda_id = ? ORDER BY sku_tienda",
    )
    .bind(tid)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(skus, vec!["1".to_string(), "2".to_string()]);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM historico_precios WHERE tienda_id = ?", tid).await,
        2
    );
}
