use actix_web::{
    error::{ErrorBadRequest, ErrorInternalServerError},
    middleware::Logger,
    web, App, HttpResponse, HttpServer, Responder,
};
use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::MySqlPool;
use tracing::{error, info};

use crate::db::list_tiendas;
use crate::report::{basket, daily_averages, kpis, BasketComparison, ReportFilter};

#[derive(Clone)]
pub struct AppState {
    pool: MySqlPool,
}

impl AppState {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Deserialize)]
struct ReportPayload {
    start: NaiveDate,
    end: NaiveDate,
    eans: Vec<String>,
    #[serde(default)]
    tiendas: Vec<i64>,
    #[serde(default)]
    categorias: Vec<String>,
    #[serde(default)]
    subcategorias: Vec<String>,
    #[serde(default)]
    marcas: Vec<String>,
    /// Effective price (offer when lower) instead of list price.
    #[serde(default = "default_effective")]
    effective: bool,
}

fn default_effective() -> bool {
    true
}

impl ReportPayload {
    fn into_filter(self) -> Result<(ReportFilter, bool), actix_web::Error> {
        let eans: Vec<String> = self
            .eans
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        let filter = ReportFilter {
            start: self.start,
            end: self.end,
            tienda_ids: self.tiendas,
            categorias: self.categorias,
            subcategorias: self.subcategorias,
            marcas: self.marcas,
            eans,
        };
        filter.validate().map_err(ErrorBadRequest)?;
        Ok((filter, self.effective))
    }
}

fn internal(context: &str, err: anyhow::Error) -> actix_web::Error {
    error!("{}: {:#}", context, err);
    ErrorInternalServerError(format!("{} failed", context))
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn stores_handler(state: web::Data<AppState>) -> Result<impl Responder, actix_web::Error> {
    let tiendas = list_tiendas(&state.pool)
        .await
        .map_err(|e| internal("Store listing", e))?;
    Ok(HttpResponse::Ok().json(tiendas))
}

async fn basket_handler(
    state: web::Data<AppState>,
    payload: web::Json<ReportPayload>,
) -> Result<impl Responder, actix_web::Error> {
    let (filter, effective) = payload.into_inner().into_filter()?;
    let lines = basket(&state.pool, &filter, effective)
        .await
        .map_err(|e| internal("Basket report", e))?;
    let comparison = BasketComparison::from_lines(&lines, &filter.eans);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "lines": lines,
        "comparison": comparison,
    })))
}

async fn daily_handler(
    state: web::Data<AppState>,
    payload: web::Json<ReportPayload>,
) -> Result<impl Responder, actix_web::Error> {
    let (filter, effective) = payload.into_inner().into_filter()?;
    let rows = daily_averages(&state.pool, &filter, effective)
        .await
        .map_err(|e| internal("Daily report", e))?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn kpis_handler(
    state: web::Data<AppState>,
    payload: web::Json<ReportPayload>,
) -> Result<impl Responder, actix_web::Error> {
    let (filter, _) = payload.into_inner().into_filter()?;
    let summary = kpis(&state.pool, &filter)
        .await
        .map_err(|e| internal("KPI report", e))?;
    Ok(HttpResponse::Ok().json(summary))
}

/// Routes of the reporting API; the caller registers an [`AppState`].
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/stores", web::get().to(stores_handler))
        .route("/report/basket", web::post().to(basket_handler))
        .route("/report/daily", web::post().to(daily_handler))
        .route("/report/kpis", web::post().to(kpis_handler));
}

pub async fn run_report_server(addr: &str, pool: MySqlPool) -> Result<()> {
    let state = AppState::new(pool);

    info!("Starting report service on {}", addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .configure(configure)
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}
