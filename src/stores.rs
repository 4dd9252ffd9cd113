use reqwest::Url;

use crate::vtex::discovery::CatalogSource;

#[derive(Debug, Clone, PartialEq)]
pub struct StoreProfile {
    pub codigo: String,
    pub nombre: String,
    pub base_url: String,
    pub sales_channel: Option<u32>,
    pub source: CatalogSource,
    /// Run an extra `ft=` sweep after the main source to catch orphans.
    pub term_sweep: bool,
}

impl StoreProfile {
    pub fn custom(codigo: &str, nombre: &str, base_url: &str, sales_channel: Option<u32>) -> Self {
        Self {
            codigo: codigo.trim().to_string(),
            nombre: nombre.trim().to_string(),
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            sales_channel,
            source: CatalogSource::Categories {
                depth: 3,
                leaves_only: true,
            },
            term_sweep: false,
        }
    }
}

fn vtex(codigo: &str, nombre: &str, base_url: &str, sales_channel: Option<u32>) -> StoreProfile {
    StoreProfile::custom(codigo, nombre, base_url, sales_channel)
}

/// VTEX storefronts with a known configuration.
pub fn builtin_stores() -> Vec<StoreProfile> {
    vec![
        vtex("https://www.carrefour.com.ar", "Carrefour Argentina", "https://www.carrefour.com.ar", Some(1)),
        vtex("jumbo_ar", "Jumbo Argentina", "https://www.jumbo.com.ar", Some(1)),
        vtex("disco", "Disco Argentina", "https://www.disco.com.ar", Some(1)),
        vtex("vea", "Vea", "https://www.vea.com.ar", Some(1)),
        vtex("dia", "DIA Argentina", "https://diaonline.supermercadosdia.com.ar", Some(1)),
        vtex("masonline", "Masonline", "https://www.masonline.com.ar", None),
        StoreProfile {
            term_sweep: true,
            ..vtex("modomarket", "Modo Market", "https://www.modomarket.com", Some(1))
        },
        vtex("hiperlibertad", "Hiper Libertad", "https://www.hiperlibertad.com.ar", Some(1)),
        vtex("exito", "Exito", "https://www.exito.com", None),
        vtex("https://www.carulla.com", "Carulla", "https://www.carulla.com", None),
    ]
}

/// Looks a store up by code, or by host when given a URL.
pub fn find_store(key: &str) -> Option<StoreProfile> {
    let key = key.trim().trim_end_matches('/').to_lowercase();
    builtin_stores().into_iter().find(|s| {
        s.codigo.to_lowercase() == key
            || s.base_url.to_lowercase() == key
            || host(&key).is_some_and(|h| host(&s.base_url).as_deref() == Some(h.as_str()))
    })
}

/// Host without a leading `www.`; bare hosts such as `vea.com.ar` count too.
fn host(url: &str) -> Option<String> {
    let url = url.trim();
    let parsed = if url.contains("://") {
        Url::parse(url).ok()?
    } else {
        Url::parse(&format!("https://{}", url)).ok()?
    };
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}
