use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use sqlx::MySqlPool;
use tracing::{error, info, warn};

use precios_cli::config::AppConfig;
use precios_cli::db::{self, PersistSummary};
use precios_cli::dom::{
    scrape_listing, scrape_menu, CardSelectors, DomListingConfig, MenuSelectors, ScrollPolicy,
};
use precios_cli::export::{default_output_path, write_csv, write_report_csv};
use precios_cli::http::HttpSession;
use precios_cli::linking::{
    candidate_pool, delete_orphans, pending_skus, rank_candidates, reassign, PendingFilter,
    RankOptions, DEFAULT_THRESHOLD,
};
use precios_cli::normalize::{normalize_ean, ProductRow};
use precios_cli::pipeline::{lookup_eans, run_store, RunOptions};
use precios_cli::report::{self, BasketComparison, ReportFilter};
use precios_cli::report_service::run_report_server;
use precios_cli::stores::{builtin_stores, find_store, StoreProfile};
use precios_cli::vtex::paginate::{PaginationConfig, SplitStrategy};
use precios_cli::vtex::VtexClient;

struct RunReport {
    total_stores: usize,
    successful: usize,
    failed: usize,
    rows: usize,
    requests: usize,
    capped_leaves: usize,
    incomplete_partitions: usize,
    duration_secs: f64,
    rows_per_minute: f64,
    success_rate: f64,
}

impl RunReport {
    fn new(
        total_stores: usize,
        successful: usize,
        rows: usize,
        requests: usize,
        capped_leaves: usize,
        duration_secs: f64,
    ) -> Self {
        let rows_per_minute = if duration_secs > 0.0 {
            (rows as f64 / duration_secs) * 60.0
        } else {
            0.0
        };

        let success_rate = if total_stores > 0 {
            (successful as f64 / total_stores as f64) * 100.0
        } else {
            0.0
        };

        Self {
            total_stores,
            successful,
            failed: total_stores - successful,
            rows,
            requests,
            capped_leaves,
            incomplete_partitions: 0,
            duration_secs,
            rows_per_minute,
            success_rate,
        }
    }

    fn with_incomplete(mut self, incomplete_partitions: usize) -> Self {
        self.incomplete_partitions = incomplete_partitions;
        self
    }

    fn is_complete(&self) -> bool {
        self.failed == 0 && self.capped_leaves == 0 && self.incomplete_partitions == 0
    }

    fn format_duration(&self) -> String {
        let total_secs = self.duration_secs as u64;
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    fn display(&self) {
        println!("\n╔══════════════════════════════════════════════════════════╗");
        println!("║              RUN REPORT                                  ║");
        println!("╠══════════════════════════════════════════════════════════╣");
        println!("║  Stores:                  {:>30} ║", self.total_stores);
        println!("║  Successful:              {:>30} ║", self.successful);
        println!("║  Failed:                  {:>30} ║", self.failed);
        println!("║  SKU rows:                {:>30} ║", self.rows);
        println!("║  API requests:            {:>30} ║", self.requests);
        println!("║  Capped partitions:       {:>30} ║", self.capped_leaves);
        println!("║  Incomplete partitions:   {:>30} ║", self.incomplete_partitions);
        println!(
            "║  Duration:                {:>30} ║",
            self.format_duration()
        );
        println!(
            "║  Throughput:              {:>22.2} rows/min ║",
            self.rows_per_minute
        );
        println!(
            "║  Success Rate:            {:>27.1}%   ║",
            self.success_rate
        );

        // capped or incomplete partitions mean some products may be missing
        let status = if self.is_complete() {
            "🟢 COMPLETE"
        } else if self.success_rate >= 75.0 {
            "🟡 PARTIAL"
        } else {
            "🔴 NEEDS ATTENTION"
        };

        println!("║  Status:                  {:>30}║", status);
        println!("╚══════════════════════════════════════════════════════════╝\n");
    }
}

#[derive(Parser)]
#[command(name = "precios-cli")]
#[command(about = "Retail price scraping and reporting CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where captured rows go.
#[derive(Args, Debug, Clone)]
struct SinkArgs {
    /// CSV file, or a directory when several stores run
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    no_csv: bool,

    /// Upsert into the MySQL schema
    #[arg(long, default_value_t = false)]
    mysql: bool,

    #[arg(long, default_value_t = 100)]
    batch_size: usize,
}

#[derive(Args, Debug, Clone)]
struct ReportArgs {
    #[arg(long)]
    start: NaiveDate,

    #[arg(long)]
    end: NaiveDate,

    #[arg(long, value_delimiter = ',')]
    eans: Vec<String>,

    /// File with one EAN per line (first column of a CSV works too)
    #[arg(long)]
    eans_file: Option<PathBuf>,

    #[arg(long, value_delimiter = ',')]
    tiendas: Vec<i64>,

    #[arg(long, value_delimiter = ',')]
    categorias: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    subcategorias: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    marcas: Vec<String>,

    /// Use list price instead of the effective price
    #[arg(long, default_value_t = false)]
    list_price: bool,

    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ReportCommand {
    Basket(ReportArgs),
    Daily(ReportArgs),
    Kpis(ReportArgs),
    Detail {
        #[command(flatten)]
        args: ReportArgs,

        #[arg(long, default_value_t = 50_000)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum LinkCommand {
    /// Rank EAN-bearing products for SKUs whose product has no EAN
    Suggest {
        #[arg(long)]
        tienda_id: Option<i64>,

        #[arg(long)]
        marca: Option<String>,

        #[arg(long)]
        categoria: Option<String>,

        #[arg(short, long)]
        query: Option<String>,

        #[arg(short, long, default_value_t = 2000)]
        limit: i64,

        #[arg(long, default_value_t = 40_000)]
        pool_limit: i64,

        #[arg(long, default_value_t = 3)]
        top_k: usize,

        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,

        #[arg(long, default_value_t = false)]
        same_brand: bool,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Move SKUs onto a product and clean up emptied products
    Apply {
        #[arg(long, value_delimiter = ',', required = true)]
        pt_ids: Vec<i64>,

        #[arg(long)]
        producto_id: i64,

        /// Products to delete when left without EAN and SKUs
        #[arg(long, value_delimiter = ',')]
        delete_orphans: Vec<i64>,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in store profiles
    Stores,

    /// Harvest VTEX stores through the catalog API
    Scrape {
        /// Store codes or URLs; `all` runs every built-in profile
        #[arg(short, long, value_delimiter = ',')]
        store: Vec<String>,

        /// Ad hoc store base URL
        #[arg(long)]
        base: Option<String>,

        #[arg(long)]
        codigo: Option<String>,

        #[arg(long)]
        nombre: Option<String>,

        /// Sales channel (`sc=`)
        #[arg(long)]
        sc: Option<u32>,

        #[arg(short, long, default_value_t = 6)]
        workers: usize,

        #[arg(long)]
        max_partitions: Option<usize>,

        #[arg(long, default_value_t = 50)]
        step: usize,

        #[arg(long, default_value_t = 2500)]
        window_cap: usize,

        #[arg(long, value_delimiter = ',', default_value = "brand,price,alpha")]
        split: Vec<SplitStrategy>,

        /// Upper price bound when a store publishes no price facets and the
        /// top price cannot be read
        #[arg(long, default_value_t = 5_000_000.0)]
        max_price: f64,

        /// Extra `ft=` sweep after the catalog source
        #[arg(long, default_value_t = false)]
        term_sweep: bool,

        #[command(flatten)]
        sink: SinkArgs,
    },

    /// Scrape a rendered listing page with infinite scroll, or every
    /// category linked from its menu when `--menu-trigger` is given
    Dom {
        #[arg(long)]
        url: String,

        #[arg(long)]
        codigo: String,

        #[arg(long)]
        nombre: Option<String>,

        /// Menu entries to hover or click open, e.g. `nav li.menu-item`
        #[arg(long)]
        menu_trigger: Option<String>,

        /// Category links inside the expanded menu
        #[arg(long, default_value = "nav a[href]")]
        menu_link: String,

        /// Control that opens the menu before its entries are visible
        #[arg(long)]
        menu_opener: Option<String>,

        #[arg(long)]
        categoria: Option<String>,

        #[arg(long)]
        subcategoria: Option<String>,

        #[arg(long)]
        item_selector: Option<String>,

        #[arg(long)]
        name_selector: Option<String>,

        #[arg(long)]
        price_selector: Option<String>,

        #[arg(long)]
        list_price_selector: Option<String>,

        #[arg(long)]
        ean_attr: Option<String>,

        #[arg(long, default_value_t = 60)]
        max_rounds: usize,

        #[arg(long)]
        webdriver_url: Option<String>,

        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        headless: bool,

        /// Abort image, font and stylesheet downloads
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        block_resources: bool,

        #[command(flatten)]
        sink: SinkArgs,
    },

    /// Look EANs up across VTEX stores
    Lookup {
        #[arg(long, value_delimiter = ',')]
        eans: Vec<String>,

        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(short, long, value_delimiter = ',', default_value = "jumbo_ar,disco,vea,dia")]
        store: Vec<String>,

        #[arg(short, long, default_value_t = 8)]
        workers: usize,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Create the tables when missing
    Schema,

    /// List stores stored in the database
    Tiendas,

    /// Assign province, branch or external reference to a store
    Region {
        #[arg(long)]
        codigo: String,

        #[arg(long)]
        provincia: Option<String>,

        #[arg(long)]
        sucursal: Option<String>,

        #[arg(long)]
        ref_tienda: Option<String>,
    },

    Report {
        #[command(subcommand)]
        kind: ReportCommand,
    },

    Link {
        #[command(subcommand)]
        action: LinkCommand,
    },

    /// Serve the reporting API
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

fn resolve_profiles(
    keys: &[String],
    base: Option<String>,
    codigo: Option<String>,
    nombre: Option<String>,
    sc: Option<u32>,
    term_sweep: bool,
) -> Result<Vec<StoreProfile>> {
    let mut profiles = Vec::new();

    if let Some(base) = base {
        let codigo = codigo.unwrap_or_else(|| base.clone());
        let nombre = nombre.unwrap_or_else(|| codigo.clone());
        profiles.push(StoreProfile::custom(&codigo, &nombre, &base, sc));
    }

    for key in keys {
        if key.eq_ignore_ascii_case("all") {
            profiles.extend(builtin_stores());
            continue;
        }
        match find_store(key) {
            Some(profile) => profiles.push(profile),
            None => bail!("Unknown store '{}'. Run `precios-cli stores` or pass --base", key),
        }
    }

    if profiles.is_empty() {
        bail!("No store selected: use --store or --base");
    }
    for profile in &mut profiles {
        if sc.is_some() {
            profile.sales_channel = sc;
        }
        profile.term_sweep |= term_sweep;
    }
    Ok(profiles)
}

/// EANs from the flag list and an optional file; duplicates and invalid codes
/// are dropped.
fn read_eans(list: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut raw: Vec<String> = list.to_vec();
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read EAN file {}", path.display()))?;
        raw.extend(
            contents
                .lines()
                .filter_map(|line| line.split([',', ';', '\t']).next())
                .map(|cell| cell.trim().trim_matches('"').to_string()),
        );
    }

    let mut eans: Vec<String> = Vec::new();
    for value in raw {
        match normalize_ean(&value) {
            Some(ean) if !eans.contains(&ean) => eans.push(ean),
            Some(_) => {}
            None if value.trim().is_empty() => {}
            None => warn!("Ignoring invalid EAN '{}'", value.trim()),
        }
    }
    Ok(eans)
}

fn capture_timestamp() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

fn csv_path(sink: &SinkArgs, codigo: &str, many: bool) -> PathBuf {
    let file_name = default_output_path(codigo, Local::now().date_naive());
    match &sink.output {
        Some(path) if many || path.is_dir() => path.join(file_name),
        Some(path) => path.clone(),
        None => file_name,
    }
}

async fn connect_db(config: &AppConfig) -> Result<MySqlPool> {
    db::connect(&config.database.database_url(), 5).await
}

async fn deliver(
    rows: &[ProductRow],
    codigo: &str,
    nombre: &str,
    sink: &SinkArgs,
    pool: Option<&MySqlPool>,
    capturado_en: NaiveDateTime,
    many: bool,
) -> Result<Option<PersistSummary>> {
    if !sink.no_csv {
        let path = csv_path(sink, codigo, many);
        write_csv(&path, rows)?;
    }

    match pool {
        Some(pool) => {
            let summary = db::persist_rows(pool, codigo, nombre, rows, capturado_en, sink.batch_size)
                .await
                .with_context(|| format!("Failed to persist rows for {}", codigo))?;
            info!(
                "🗄️  {}: {} rows upserted in {} batches ({} skipped, {} lock retries)",
                codigo, summary.inserted, summary.batches, summary.skipped, summary.lock_retries
            );
            Ok(Some(summary))
        }
        None => Ok(None),
    }
}

fn report_filter(args: &ReportArgs) -> Result<ReportFilter> {
    let filter = ReportFilter {
        start: args.start,
        end: args.end,
        tienda_ids: args.tiendas.clone(),
        categorias: args.categorias.clone(),
        subcategorias: args.subcategorias.clone(),
        marcas: args.marcas.clone(),
        eans: read_eans(&args.eans, args.eans_file.as_deref())?,
    };
    if let Err(message) = filter.validate() {
        bail!("Invalid report filter: {}", message);
    }
    Ok(filter)
}

fn print_basket(comparison: &BasketComparison) {
    println!(
        "\n{:<30} {:>14} {:>10} {:>10}",
        "Store", "Total", "Found", "Coverage"
    );
    println!("{}", "-".repeat(68));
    for store in &comparison.stores {
        println!(
            "{:<30} {:>14.2} {:>6}/{:<3} {:>9.0}%",
            store.tienda,
            store.total,
            store.found,
            comparison.requested,
            store.coverage * 100.0
        );
    }
    match &comparison.cheapest_complete {
        Some(tienda) => println!("\nCheapest complete basket: {}", tienda),
        None => println!("\nNo store carries the complete basket"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Stores => {
            println!(
                "\n{:<30} {:<24} {:<45} {:>4}",
                "Code", "Name", "Base URL", "SC"
            );
            println!("{}", "-".repeat(106));
            for store in builtin_stores() {
                println!(
                    "{:<30} {:<24} {:<45} {:>4}",
                    store.codigo,
                    store.nombre,
                    store.base_url,
                    store
                        .sales_channel
                        .map(|sc| sc.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }

        Commands::Scrape {
            store,
            base,
            codigo,
            nombre,
            sc,
            workers,
            max_partitions,
            step,
            window_cap,
            split,
            max_price,
            term_sweep,
            sink,
        } => {
            let start_time = Instant::now();
            let profiles = resolve_profiles(&store, base, codigo, nombre, sc, term_sweep)?;
            let many = profiles.len() > 1;

            let pool = if sink.mysql {
                let pool = connect_db(&config).await?;
                let mut conn = pool.acquire().await?;
                db::ensure_schema(&mut conn).await?;
                Some(pool)
            } else {
                None
            };
            if sink.no_csv && pool.is_none() {
                bail!("Nothing to write: --no-csv without --mysql");
            }

            let options = RunOptions {
                pagination: PaginationConfig {
                    step: step.max(1),
                    window_cap,
                    split_order: split,
                    max_price,
                    ..PaginationConfig::default()
                },
                max_workers: workers,
                max_partitions,
                ..RunOptions::default()
            };
            let capturado_en = capture_timestamp();

            let mut successful = 0;
            let mut total_rows = 0;
            let mut total_requests = 0;
            let mut total_capped = 0;
            let mut total_incomplete = 0;

            for (idx, profile) in profiles.iter().enumerate() {
                info!(
                    "========== Store {}/{}: {} ==========",
                    idx + 1,
                    profiles.len(),
                    profile.nombre
                );

                let client = VtexClient::new(HttpSession::new(&config.http)?, &profile.base_url);
                if !client.probe().await {
                    warn!("{} did not answer like a VTEX store; trying anyway", profile.base_url);
                }

                match run_store(&client, profile, &options).await {
                    Ok(run) => {
                        total_requests += run.requests;
                        total_capped += run.capped_leaves;
                        total_incomplete += run.failed_partitions;
                        total_rows += run.rows.len();
                        match deliver(
                            &run.rows,
                            &run.codigo,
                            &profile.nombre,
                            &sink,
                            pool.as_ref(),
                            capturado_en,
                            many,
                        )
                        .await
                        {
                            Ok(_) => {
                                successful += 1;
                                info!(
                                    "  [{}/{}] ✓ {}: {} rows from {} partitions ({} incomplete) in {:.1}s",
                                    idx + 1,
                                    profiles.len(),
                                    run.codigo,
                                    run.rows.len(),
                                    run.partitions,
                                    run.failed_partitions,
                                    run.duration.as_secs_f64()
                                );
                            }
                            Err(e) => error!("  [{}/{}] ✗ {}: {:#}", idx + 1, profiles.len(), run.codigo, e),
                        }
                    }
                    Err(e) => error!("  [{}/{}] ✗ {}: {:#}", idx + 1, profiles.len(), profile.codigo, e),
                }

                if idx + 1 < profiles.len() {
                    let mut rng = rand::thread_rng();
                    let delay_secs = rng.gen_range(8..=12);
                    info!("⏸️  Waiting {} seconds before next store...", delay_secs);
                    tokio::time::sleep(tokio::time::Duration::from_secs(delay_secs)).await;
                }
            }

            RunReport::new(
                profiles.len(),
                successful,
                total_rows,
                total_requests,
                total_capped,
                start_time.elapsed().as_secs_f64(),
            )
            .with_incomplete(total_incomplete)
            .display();
        }

        Commands::Dom {
            url,
            codigo,
            nombre,
            menu_trigger,
            menu_link,
            menu_opener,
            categoria,
            subcategoria,
            item_selector,
            name_selector,
            price_selector,
            list_price_selector,
            ean_attr,
            max_rounds,
            webdriver_url,
            headless,
            block_resources,
            sink,
        } => {
            let start_time = Instant::now();
            if sink.no_csv && !sink.mysql {
                bail!("Nothing to write: --no-csv without --mysql");
            }

            let defaults = CardSelectors::default();
            let selectors = CardSelectors {
                item: item_selector.unwrap_or(defaults.item),
                name: name_selector.unwrap_or(defaults.name),
                price: price_selector.unwrap_or(defaults.price),
                list_price: list_price_selector.or(defaults.list_price),
                ean_attr: ean_attr.or(defaults.ean_attr),
                ..defaults
            };
            let listing = DomListingConfig {
                url,
                selectors,
                category: categoria,
                subcategory: subcategoria,
                headless,
                block_resources,
                policy: ScrollPolicy {
                    max_rounds,
                    ..ScrollPolicy::default()
                },
            };

            let webdriver_url = webdriver_url.unwrap_or_else(|| config.webdriver_url.clone());
            let rows = match menu_trigger {
                Some(trigger) => {
                    let menu = MenuSelectors {
                        opener: menu_opener,
                        trigger,
                        link: menu_link,
                    };
                    scrape_menu(&webdriver_url, &listing, &menu).await?
                }
                None => scrape_listing(&webdriver_url, &listing).await?,
            };
            info!("{} cards parsed from {}", rows.len(), listing.url);

            let pool = if sink.mysql {
                let pool = connect_db(&config).await?;
                let mut conn = pool.acquire().await?;
                db::ensure_schema(&mut conn).await?;
                Some(pool)
            } else {
                None
            };
            let nombre = nombre.unwrap_or_else(|| codigo.clone());
            deliver(
                &rows,
                &codigo,
                &nombre,
                &sink,
                pool.as_ref(),
                capture_timestamp(),
                false,
            )
            .await?;

            RunReport::new(1, 1, rows.len(), 0, 0, start_time.elapsed().as_secs_f64()).display();
        }

        Commands::Lookup {
            eans,
            file,
            store,
            workers,
            output,
        } => {
            let eans = read_eans(&eans, file.as_deref())?;
            if eans.is_empty() {
                bail!("No valid EAN given: use --eans or --file");
            }
            let profiles = resolve_profiles(&store, None, None, None, None, false)?;
            let stores: Vec<(StoreProfile, VtexClient)> = profiles
                .into_iter()
                .map(|p| {
                    let client = VtexClient::new(HttpSession::new(&config.http)?, &p.base_url);
                    Ok::<_, anyhow::Error>((p, client))
                })
                .collect::<Result<_>>()?;

            info!("Looking up {} EANs across {} stores", eans.len(), stores.len());
            let hits = lookup_eans(&stores, &eans, workers).await;

            for hit in &hits {
                println!(
                    "  {} | {:<24} | {:<50} | {:>10} | {:>10}",
                    hit.ean,
                    hit.tienda,
                    hit.nombre,
                    hit.precio_lista.map(|p| format!("{:.2}", p)).unwrap_or_default(),
                    hit.precio_oferta.map(|p| format!("{:.2}", p)).unwrap_or_default()
                );
            }
            let found: std::collections::HashSet<&str> = hits.iter().map(|h| h.ean.as_str()).collect();
            info!("{}/{} EANs found in at least one store", found.len(), eans.len());

            if let Some(path) = output {
                write_report_csv(&path, &hits)?;
            }
        }

        Commands::Schema => {
            let pool = connect_db(&config).await?;
            let mut conn = pool.acquire().await?;
            db::ensure_schema(&mut conn).await?;
        }

        Commands::Tiendas => {
            let pool = connect_db(&config).await?;
            let tiendas = db::list_tiendas(&pool).await?;
            if tiendas.is_empty() {
                info!("No stores in the database");
            }
            for t in tiendas {
                println!(
                    "  {:>4} | {:<35} | {:<30} | {:<12} | {:<20} | {}",
                    t.id,
                    t.codigo,
                    t.nombre,
                    t.ref_tienda.unwrap_or_default(),
                    t.provincia.unwrap_or_default(),
                    t.sucursal.unwrap_or_default()
                );
            }
        }

        Commands::Region {
            codigo,
            provincia,
            sucursal,
            ref_tienda,
        } => {
            if provincia.is_none() && sucursal.is_none() && ref_tienda.is_none() {
                bail!("Nothing to assign: pass --provincia, --sucursal or --ref-tienda");
            }
            let pool = connect_db(&config).await?;
            let updated = db::assign_region(
                &pool,
                &codigo,
                provincia.as_deref(),
                sucursal.as_deref(),
                ref_tienda.as_deref(),
            )
            .await?;
            if updated {
                info!("✓ Region updated for {}", codigo);
            } else {
                warn!("No store with code {} (or values unchanged)", codigo);
            }
        }

        Commands::Report { kind } => {
            let pool = connect_db(&config).await?;
            match kind {
                ReportCommand::Basket(args) => {
                    let filter = report_filter(&args)?;
                    let lines = report::basket(&pool, &filter, !args.list_price).await?;
                    let comparison = BasketComparison::from_lines(&lines, &filter.eans);
                    print_basket(&comparison);
                    if let Some(path) = &args.output {
                        write_report_csv(path, &lines)?;
                    }
                }
                ReportCommand::Daily(args) => {
                    let filter = report_filter(&args)?;
                    let rows = report::daily_averages(&pool, &filter, !args.list_price).await?;
                    for row in &rows {
                        println!(
                            "  {} | {:<30} | {:>12}",
                            row.dia,
                            row.tienda,
                            row.precio_promedio
                                .map(|p| format!("{:.2}", p))
                                .unwrap_or_default()
                        );
                    }
                    if let Some(path) = &args.output {
                        write_report_csv(path, &rows)?;
                    }
                }
                ReportCommand::Kpis(args) => {
                    let filter = report_filter(&args)?;
                    let k = report::kpis(&pool, &filter).await?;
                    println!("  Observations:      {}", k.observaciones);
                    println!("  Distinct products: {}", k.productos_distintos);
                    println!("  Mean price:        {:.2}", k.precio_medio.unwrap_or(0.0));
                    println!("  On offer:          {:.1}%", k.share_oferta.unwrap_or(0.0) * 100.0);
                    println!(
                        "  Mean discount:     {:.1}%",
                        k.descuento_promedio.unwrap_or(0.0) * 100.0
                    );
                }
                ReportCommand::Detail { args, limit } => {
                    let filter = report_filter(&args)?;
                    let rows = report::detail(&pool, &filter, limit).await?;
                    let path = args.output.clone().unwrap_or_else(|| {
                        PathBuf::from(format!(
                            "Reporte_{}_{}.csv",
                            filter.start.format("%Y%m%d"),
                            filter.end.format("%Y%m%d")
                        ))
                    });
                    write_report_csv(&path, &rows)?;
                }
            }
        }

        Commands::Link { action } => {
            let pool = connect_db(&config).await?;
            match action {
                LinkCommand::Suggest {
                    tienda_id,
                    marca,
                    categoria,
                    query,
                    limit,
                    pool_limit,
                    top_k,
                    threshold,
                    same_brand,
                    output,
                } => {
                    let pending = pending_skus(
                        &pool,
                        &PendingFilter {
                            tienda_id,
                            marca: marca.clone(),
                            categoria: categoria.clone(),
                            query,
                            limit,
                        },
                    )
                    .await?;
                    if pending.is_empty() {
                        info!("No SKUs without EAN match the filter");
                        return Ok(());
                    }

                    let marcas: Vec<String> = marca.into_iter().collect();
                    let categorias: Vec<String> = categoria.into_iter().collect();
                    let candidates = candidate_pool(&pool, &marcas, &categorias, pool_limit).await?;
                    info!(
                        "Ranking {} SKUs against {} candidates",
                        pending.len(),
                        candidates.len()
                    );

                    let suggestions = rank_candidates(
                        &pending,
                        &candidates,
                        &RankOptions {
                            top_k,
                            threshold,
                            same_brand_only: same_brand,
                        },
                    );
                    for s in &suggestions {
                        println!(
                            "  {:.3} | pt {:>7} | {:<45} -> {:>7} {} {}",
                            s.score,
                            s.pt_id,
                            s.nombre_tienda.as_deref().unwrap_or_default(),
                            s.destino_producto_id,
                            s.ean_destino,
                            s.nombre_destino
                        );
                    }
                    info!("{} suggestions above {:.2}", suggestions.len(), threshold);
                    if let Some(path) = output {
                        write_report_csv(&path, &suggestions)?;
                    }
                }
                LinkCommand::Apply {
                    pt_ids,
                    producto_id,
                    delete_orphans: orphans,
                } => {
                    let updated = reassign(&pool, &pt_ids, producto_id).await?;
                    println!("✓ {} SKUs now point to producto {}", updated, producto_id);
                    if !orphans.is_empty() {
                        let deleted = delete_orphans(&pool, &orphans).await?;
                        println!("✓ {} orphan products deleted", deleted);
                    }
                }
            }
        }

        Commands::Serve { bind } => {
            let pool = connect_db(&config).await?;
            let addr = bind.unwrap_or_else(|| config.report_bind.clone());
            run_report_server(&addr, pool).await?;
        }
    }

    Ok(())
}
