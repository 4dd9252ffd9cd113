use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::normalize::ProductRow;

pub const LISTING_HEADERS: [&str; 12] = [
    "EAN",
    "Codigo Interno",
    "Nombre Producto",
    "Categoria",
    "Subcategoria",
    "Marca",
    "Fabricante",
    "Precio de Lista",
    "Precio de Oferta",
    "Tipo de Oferta",
    "URL",
    "SKU",
];

fn price_cell(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

fn text_cell(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

/// `Listado_{codigo}_{YYYYMMDD}.csv`, with the code reduced to a file-safe slug.
pub fn default_output_path(codigo: &str, date: NaiveDate) -> PathBuf {
    let slug: String = codigo
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    PathBuf::from(format!("Listado_{}_{}.csv", slug, date.format("%Y%m%d")))
}

/// Product listing in the spreadsheet layout used for store deliveries.
pub fn write_csv(path: &Path, rows: &[ProductRow]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    let mut wtr = csv::Writer::from_writer(file);

    wtr.write_record(LISTING_HEADERS)?;
    for row in rows {
        let list = price_cell(row.list_price);
        let offer = price_cell(row.offer_price);
        wtr.write_record([
            text_cell(&row.ean),
            text_cell(&row.reference_code),
            row.name.as_str(),
            text_cell(&row.category),
            text_cell(&row.subcategory),
            text_cell(&row.brand),
            text_cell(&row.manufacturer),
            list.as_str(),
            offer.as_str(),
            text_cell(&row.offer_type),
            text_cell(&row.url),
            text_cell(&row.sku),
        ])?;
    }

    wtr.flush()?;
    info!("💾 Exported {} records to {}", rows.len(), path.display());
    Ok(())
}

/// Any serializable report rows; headers come from the field names.
pub fn write_report_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    let mut wtr = csv::Writer::from_writer(file);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    info!("💾 Exported {} report rows to {}", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("precios_cli_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_default_output_path() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(
            default_output_path("jumbo_ar", date),
            PathBuf::from("Listado_jumbo_ar_20250307.csv")
        );
        assert_eq!(
            default_output_path("https://www.carrefour.com.ar", date),
            PathBuf::from("Listado_carrefour_com_ar_20250307.csv")
        );
    }

    #[test]
    fn test_write_csv_layout() {
        let path = temp_path("listado.csv");
        let rows = vec![ProductRow {
            ean: Some("7790070410120".into()),
            sku: Some("123".into()),
            reference_code: Some("REF-9".into()),
            name: "Yerba, Mate 1 kg".into(),
            brand: Some("Playadito".into()),
            list_price: Some(4599.0),
            offer_price: Some(3899.5),
            url: Some("https://x.com/yerba/p".into()),
            ..ProductRow::default()
        }];
        write_csv(&path, &rows).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "EAN,Codigo Interno,Nombre Producto,Categoria,Subcategoria,Marca,Fabricante,\
             Precio de Lista,Precio de Oferta,Tipo de Oferta,URL,SKU"
        );
        assert_eq!(
            lines.next().unwrap(),
            "7790070410120,REF-9,\"Yerba, Mate 1 kg\",,,Playadito,,4599.00,3899.50,,https://x.com/yerba/p,123"
        );
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_report_csv_uses_field_names() {
        #[derive(Serialize)]
        struct Line {
            tienda: String,
            precio: Option<f64>,
        }
        let path = temp_path("report.csv");
        write_report_csv(
            &path,
            &[Line {
                tienda: "Vea".into(),
                precio: Some(10.5),
            }],
        )
        .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "tienda,precio\nVea,10.5\n");
        fs::remove_file(&path).ok();
    }
}
