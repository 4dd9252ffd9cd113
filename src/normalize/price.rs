use std::sync::OnceLock;

use regex::Regex;

fn thousands_dot() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?\d{1,3}(\.\d{3})+$").ok())
        .as_ref()
}

/// Parses storefront price strings such as `$ 1.234,50`, `1,234.50`,
/// `2.499` or `$3999`.
///
/// When both separators appear the last one is the decimal mark. A lone comma
/// is decimal. A dot followed by groups of exactly three digits is a thousands
/// separator (`2.499` is two thousand four hundred ninety-nine), anything else
/// with a single dot is decimal.
pub fn parse_price(raw: &str) -> Option<f64> {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    let filtered = filtered.trim_matches(|c| c == '.' || c == ',');
    if !filtered.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_comma = filtered.rfind(',');
    let last_dot = filtered.rfind('.');

    let canonical = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => filtered.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => filtered.replace(',', ""),
        (Some(_), None) => {
            if filtered.matches(',').count() > 1 {
                filtered.replace(',', "")
            } else {
                filtered.replace(',', ".")
            }
        }
        (None, Some(_)) => {
            if thousands_dot().is_some_and(|re| re.is_match(filtered)) {
                filtered.replace('.', "")
            } else {
                filtered.to_string()
            }
        }
        (None, None) => filtered.to_string(),
    };

    let value: f64 = canonical.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(round2(value))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Offer price when it is positive and strictly below list, otherwise list.
pub fn effective_price(lista: Option<f64>, oferta: Option<f64>) -> Option<f64> {
    match (lista, oferta) {
        (Some(l), Some(o)) if o > 0.0 && o < l => Some(o),
        (Some(l), _) => Some(l),
        (None, _) => None,
    }
}

/// SQL rendition of [`effective_price`] over `historico_precios` aliased `h`.
pub const EFFECTIVE_PRICE_SQL: &str = "CASE WHEN h.precio_oferta IS NOT NULL AND h.precio_oferta > 0 \
     AND h.precio_lista IS NOT NULL AND h.precio_oferta < h.precio_lista \
     THEN h.precio_oferta ELSE h.precio_lista END";
