mod scroll;

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::normalize::{clean_text, normalize_ean, parse_price, ProductRow};

pub use scroll::{scroll_until_exhausted, InfiniteList, ScrollOutcome, ScrollPolicy, StopReason};

const LOAD_MORE_TEXTS: &[&str] = &["Ver más", "Mostrar más", "Cargar más", "Ver mas", "Mostrar mas"];

/// URL patterns aborted by the browser: images, fonts and stylesheets.
pub const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.avif", "*.svg", "*.ico", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.eot", "*.css",
];

/// CSS selectors describing one product card on a listing page.
#[derive(Debug, Clone)]
pub struct CardSelectors {
    pub item: String,
    pub name: String,
    pub price: String,
    pub list_price: Option<String>,
    pub link: String,
    /// Attribute on the card element carrying the EAN, e.g. `data-ean`.
    pub ean_attr: Option<String>,
    pub sku_attr: Option<String>,
}

impl Default for CardSelectors {
    fn default() -> Self {
        Self {
            item: "div.product-card, li.product-item, article.product".to_string(),
            name: ".product-name, .product-title, h2, h3".to_string(),
            price: ".best-price, .product-price, .price".to_string(),
            list_price: Some(".list-price, .old-price, del".to_string()),
            link: "a[href]".to_string(),
            ean_attr: Some("data-ean".to_string()),
            sku_attr: Some("data-sku".to_string()),
        }
    }
}

struct CompiledSelectors {
    item: Selector,
    name: Selector,
    price: Selector,
    list_price: Option<Selector>,
    link: Selector,
}

fn compile(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid CSS selector {:?}: {}", css, e))
}

impl CardSelectors {
    fn compile(&self) -> Result<CompiledSelectors> {
        Ok(CompiledSelectors {
            item: compile(&self.item)?,
            name: compile(&self.name)?,
            price: compile(&self.price)?,
            list_price: self.list_price.as_deref().map(compile).transpose()?,
            link: compile(&self.link)?,
        })
    }
}

fn first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|el| clean_text(&el.text().collect::<Vec<_>>().join(" ")))
}

/// Resolves `href` against the page it was found on. Fragments and script
/// links resolve to nothing.
fn resolve_href(page: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let url = match page {
        Some(page) => page.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Extracts product rows from a rendered listing page. Relative links are
/// resolved against `page_url`.
pub fn parse_cards(
    html: &str,
    page_url: &str,
    selectors: &CardSelectors,
    category: Option<&str>,
    subcategory: Option<&str>,
) -> Result<Vec<ProductRow>> {
    let compiled = selectors.compile()?;
    let page = Url::parse(page_url).ok();
    let document = Html::parse_document(html);
    let mut rows = Vec::new();

    for card in document.select(&compiled.item) {
        let name = match first_text(&card, &compiled.name) {
            Some(name) => name,
            None => {
                debug!("Skipping card without a name");
                continue;
            }
        };

        let offer = first_text(&card, &compiled.price).and_then(|t| parse_price(&t));
        let list = compiled
            .list_price
            .as_ref()
            .and_then(|sel| first_text(&card, sel))
            .and_then(|t| parse_price(&t))
            .or(offer);
        let url = card
            .select(&compiled.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_href(page.as_ref(), href));

        let attr = |name: &Option<String>| {
            name.as_deref()
                .and_then(|a| card.value().attr(a))
                .map(str::to_string)
        };
        let ean = attr(&selectors.ean_attr).and_then(|v| normalize_ean(&v));
        let sku = attr(&selectors.sku_attr).and_then(|v| clean_text(&v));

        let offer_type = match (list, offer) {
            (Some(l), Some(o)) if o < l => Some("Descuento".to_string()),
            _ => None,
        };

        rows.push(ProductRow {
            ean,
            sku,
            name,
            category: category.map(str::to_string),
            subcategory: subcategory.map(str::to_string),
            list_price: list,
            offer_price: offer,
            offer_type,
            url,
            ..ProductRow::default()
        });
    }

    Ok(rows)
}

/// Selectors for a navigation menu whose submenus only render once their
/// top-level entry is hovered or clicked.
#[derive(Debug, Clone)]
pub struct MenuSelectors {
    /// Control that opens the menu itself, e.g. a "Categorías" button.
    pub opener: Option<String>,
    /// Top-level entries that expand a submenu.
    pub trigger: String,
    /// Category links inside the expanded submenus.
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuCategory {
    pub name: String,
    pub url: String,
}

/// Category links in a rendered menu, resolved against `page_url`. Links
/// without text and repeated URLs are dropped.
pub fn parse_menu_links(html: &str, page_url: &str, link_selector: &str) -> Result<Vec<MenuCategory>> {
    let selector = compile(link_selector)?;
    let page = Url::parse(page_url).ok();
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut categories = Vec::new();

    for link in document.select(&selector) {
        let Some(url) = link
            .value()
            .attr("href")
            .and_then(|href| resolve_href(page.as_ref(), href))
        else {
            continue;
        };
        let Some(name) = clean_text(&link.text().collect::<Vec<_>>().join(" ")) else {
            continue;
        };
        if seen.insert(url.clone()) {
            categories.push(MenuCategory { name, url });
        }
    }
    Ok(categories)
}

fn merge_categories(into: &mut Vec<MenuCategory>, found: Vec<MenuCategory>) -> usize {
    let mut added = 0;
    for category in found {
        if !into.iter().any(|c| c.url == category.url) {
            into.push(category);
            added += 1;
        }
    }
    added
}

pub struct DomListingConfig {
    pub url: String,
    pub selectors: CardSelectors,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub headless: bool,
    pub block_resources: bool,
    pub policy: ScrollPolicy,
}

/// Listing page driven through a WebDriver session.
pub struct BrowserListing {
    driver: WebDriver,
    item_selector: String,
}

impl BrowserListing {
    pub async fn open(
        webdriver_url: &str,
        headless: bool,
        block_resources: bool,
        item_selector: &str,
    ) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();
        if headless {
            caps.add_chrome_arg("--headless")?;
        }
        caps.add_chrome_arg("--no-sandbox")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-gpu")?;
        caps.add_chrome_arg("--window-size=1920,1080")?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        if block_resources {
            caps.add_chrome_arg("--blink-settings=imagesEnabled=false")?;
        }

        let driver = WebDriver::new(webdriver_url, caps)
            .await
            .context("Failed to connect to WebDriver")?;
        driver
            .set_page_load_timeout(std::time::Duration::from_secs(60))
            .await?;

        let listing = Self {
            driver,
            item_selector: item_selector.to_string(),
        };
        if block_resources {
            if let Err(e) = listing.block_resources().await {
                warn!("Resource blocking unavailable, pages load in full: {}", e);
            }
        }
        Ok(listing)
    }

    /// Aborts image, font and stylesheet requests through the DevTools
    /// protocol. Only Chromium drivers support it.
    async fn block_resources(&self) -> Result<()> {
        let devtools = ChromeDevTools::new(self.driver.handle.clone());
        devtools.execute_cdp("Network.enable").await?;
        devtools
            .execute_cdp_with_params(
                "Network.setBlockedURLs",
                json!({ "urls": BLOCKED_RESOURCE_PATTERNS }),
            )
            .await?;
        debug!("Blocking {} resource patterns", BLOCKED_RESOURCE_PATTERNS.len());
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.driver
            .goto(url)
            .await
            .with_context(|| format!("Failed to open {}", url))?;
        sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    pub async fn html(&self) -> Result<String> {
        Ok(self.driver.source().await?)
    }

    /// Expands every submenu and collects the category links it reveals.
    /// Entries are hovered first; a click is the fallback when hovering
    /// reveals nothing new.
    pub async fn discover_menu(&self, page_url: &str, menu: &MenuSelectors) -> Result<Vec<MenuCategory>> {
        self.goto(page_url).await?;
        if let Some(opener) = &menu.opener {
            match self.driver.find(By::Css(opener.as_str())).await {
                Ok(button) => self.js_click(&button).await?,
                Err(e) => warn!("Menu opener {:?} not found: {}", opener, e),
            }
            sleep(Duration::from_millis(800)).await;
        }

        let mut categories = parse_menu_links(&self.html().await?, page_url, &menu.link)?;
        let triggers = self.driver.find_all(By::Css(menu.trigger.as_str())).await?.len();
        info!("Menu: {} top-level entries, {} links visible", triggers, categories.len());

        for idx in 0..triggers {
            // submenus re-render, so the entry is looked up again each time
            let entries = self.driver.find_all(By::Css(menu.trigger.as_str())).await?;
            let Some(entry) = entries.get(idx) else { break };
            let _ = entry.scroll_into_view().await;

            if let Err(e) = self
                .driver
                .action_chain()
                .move_to_element_center(entry)
                .perform()
                .await
            {
                debug!("Hover on menu entry {} failed: {}", idx, e);
            }
            sleep(Duration::from_millis(600)).await;
            let mut added = merge_categories(
                &mut categories,
                parse_menu_links(&self.html().await?, page_url, &menu.link)?,
            );

            if added == 0 {
                self.js_click(entry).await?;
                sleep(Duration::from_millis(800)).await;
                added = merge_categories(
                    &mut categories,
                    parse_menu_links(&self.html().await?, page_url, &menu.link)?,
                );
                // a click may navigate away from the menu page
                let current = self.driver.current_url().await?;
                if current.as_str().trim_end_matches('/') != page_url.trim_end_matches('/') {
                    self.goto(page_url).await?;
                }
            }
            debug!("Menu entry {}: {} new links", idx, added);
        }

        Ok(categories)
    }

    async fn js_click(&self, element: &WebElement) -> Result<()> {
        if element.click().await.is_err() {
            self.driver
                .execute("arguments[0].click(); return true;", vec![element.to_json()?])
                .await?;
        }
        Ok(())
    }

    /// Loads one listing to exhaustion in the open session and parses it.
    pub async fn load_listing(
        &self,
        url: &str,
        selectors: &CardSelectors,
        policy: &ScrollPolicy,
        category: Option<&str>,
        subcategory: Option<&str>,
    ) -> Result<Vec<ProductRow>> {
        self.goto(url).await?;
        let outcome = scroll_until_exhausted(self, policy).await?;
        info!(
            "{}: {} cards after {} rounds ({:?})",
            url, outcome.final_count, outcome.rounds, outcome.reason
        );
        let html = self.html().await?;
        parse_cards(&html, url, selectors, category, subcategory)
    }

    pub async fn close(self) -> Result<()> {
        self.driver.quit().await?;
        Ok(())
    }
}

#[async_trait]
impl InfiniteList for BrowserListing {
    async fn snapshot(&self) -> Result<(usize, u64)> {
        let ret = self
            .driver
            .execute(
                "return [document.querySelectorAll(arguments[0]).length, \
                 Math.max(document.body.scrollHeight, document.documentElement.scrollHeight)];",
                vec![json!(self.item_selector)],
            )
            .await?;
        let value = ret.json();
        let count = value.get(0).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let height = value.get(1).and_then(|v| v.as_u64()).unwrap_or(0);
        Ok((count, height))
    }

    async fn click_load_more(&self) -> Result<bool> {
        for text in LOAD_MORE_TEXTS {
            let xpath = format!(
                "//button[contains(normalize-space(.), '{0}')] | //a[contains(normalize-space(.), '{0}')]",
                text
            );
            let candidates = self.driver.find_all(By::XPath(&xpath)).await?;
            for button in candidates {
                if !button.is_displayed().await.unwrap_or(false) {
                    continue;
                }
                let _ = button.scroll_into_view().await;
                if button.click().await.is_err() {
                    // overlays intercept native clicks on some storefronts
                    let arg = button.to_json()?;
                    if let Err(e) = self
                        .driver
                        .execute("arguments[0].click(); return true;", vec![arg])
                        .await
                    {
                        warn!("Could not click '{}': {}", text, e);
                        continue;
                    }
                }
                debug!("Clicked '{}'", text);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn scroll_burst(&self) -> Result<()> {
        self.driver
            .execute(
                "for (let i = 0; i < 4; i++) { window.scrollBy(0, window.innerHeight); } \
                 window.scrollTo(0, document.body.scrollHeight); return true;",
                vec![],
            )
            .await?;
        sleep(Duration::from_millis(300)).await;
        Ok(())
    }
}

async fn open_listing(webdriver_url: &str, config: &DomListingConfig) -> Result<BrowserListing> {
    BrowserListing::open(
        webdriver_url,
        config.headless,
        config.block_resources,
        &config.selectors.item,
    )
    .await
}

/// Opens the listing, loads it to exhaustion and parses every card.
pub async fn scrape_listing(webdriver_url: &str, config: &DomListingConfig) -> Result<Vec<ProductRow>> {
    let listing = open_listing(webdriver_url, config).await?;

    let result = listing
        .load_listing(
            &config.url,
            &config.selectors,
            &config.policy,
            config.category.as_deref(),
            config.subcategory.as_deref(),
        )
        .await;

    if let Err(e) = listing.close().await {
        warn!("Failed to close browser session cleanly: {}", e);
    }

    result
}

/// Walks the menu on `config.url` and scrapes every category listing it
/// links to, tagging rows with the menu label. A category that fails to load
/// is logged and skipped.
pub async fn scrape_menu(
    webdriver_url: &str,
    config: &DomListingConfig,
    menu: &MenuSelectors,
) -> Result<Vec<ProductRow>> {
    let listing = open_listing(webdriver_url, config).await?;

    let result = async {
        let categories = listing.discover_menu(&config.url, menu).await?;
        info!("{} categories discovered in the menu of {}", categories.len(), config.url);

        let mut rows = Vec::new();
        for (idx, category) in categories.iter().enumerate() {
            match listing
                .load_listing(
                    &category.url,
                    &config.selectors,
                    &config.policy,
                    Some(category.name.as_str()),
                    config.subcategory.as_deref(),
                )
                .await
            {
                Ok(found) => {
                    info!(
                        "  [{}/{}] {}: {} cards",
                        idx + 1,
                        categories.len(),
                        category.name,
                        found.len()
                    );
                    rows.extend(found);
                }
                Err(e) => warn!(
                    "  [{}/{}] {} failed: {:#}",
                    idx + 1,
                    categories.len(),
                    category.name,
                    e
                ),
            }
        }
        Ok(rows)
    }
    .await;

    if let Err(e) = listing.close().await {
        warn!("Failed to close browser session cleanly: {}", e);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
    <html><body>
      <div class="grid">
        <div class="product-card" data-ean="7790070410120" data-sku="A1">
          <a href="/yerba-mate-1kg/p"><h3 class="product-name">Yerba Mate  1 kg</h3></a>
          <span class="list-price">$ 4.599,00</span>
          <span class="best-price">$ 3.899,00</span>
        </div>
        <div class="product-card">
          <a href="https://otra.com/arroz/p"><h3 class="product-name">Arroz largo fino</h3></a>
          <span class="best-price">$1.250</span>
        </div>
        <div class="product-card">
          <span class="best-price">$10</span>
        </div>
      </div>
    </body></html>
    "#;

    #[test]
    fn test_parse_cards_extracts_prices_and_links() {
        let rows = parse_cards(
            LISTING,
            "https://www.tienda.com.ar/almacen/infusiones?page=2",
            &CardSelectors::default(),
            Some("Almacén"),
            None,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Yerba Mate 1 kg");
        assert_eq!(rows[0].ean.as_deref(), Some("7790070410120"));
        assert_eq!(rows[0].sku.as_deref(), Some("A1"));
        assert_eq!(rows[0].list_price, Some(4599.0));
        assert_eq!(rows[0].offer_price, Some(3899.0));
        assert_eq!(rows[0].offer_type.as_deref(), Some("Descuento"));
        assert_eq!(
            rows[0].url.as_deref(),
            Some("https://www.tienda.com.ar/yerba-mate-1kg/p")
        );
        assert_eq!(rows[0].category.as_deref(), Some("Almacén"));

        assert_eq!(rows[1].list_price, Some(1250.0));
        assert_eq!(rows[1].offer_type, None);
        assert_eq!(rows[1].url.as_deref(), Some("https://otra.com/arroz/p"));
    }

    #[test]
    fn test_relative_links_resolve_against_the_listing() {
        let html = r#"
        <div class="product-card"><a href="yerba/p"><h3>Yerba</h3></a><span class="price">$10</span></div>
        <div class="product-card"><a href="../aceites/girasol/p"><h3>Aceite</h3></a><span class="price">$20</span></div>
        <div class="product-card"><a href="javascript:void(0)"><h3>Promo</h3></a><span class="price">$30</span></div>
        "#;
        let rows = parse_cards(
            html,
            "https://www.tienda.com.ar/almacen/infusiones/",
            &CardSelectors::default(),
            None,
            None,
        )
        .unwrap();

        let urls: Vec<Option<&str>> = rows.iter().map(|r| r.url.as_deref()).collect();
        assert_eq!(
            urls,
            vec![
                Some("https://www.tienda.com.ar/almacen/infusiones/yerba/p"),
                Some("https://www.tienda.com.ar/almacen/aceites/girasol/p"),
                None,
            ]
        );
    }

    #[test]
    fn test_menu_links_are_resolved_and_deduplicated() {
        let html = r##"
        <nav>
          <div class="menu-item"><span>Almacén</span>
            <ul class="submenu">
              <li><a class="cat" href="/almacen/infusiones">Infusiones</a></li>
              <li><a class="cat" href="/almacen/aceites"> Aceites </a></li>
              <li><a class="cat" href="/almacen/infusiones">Infusiones</a></li>
              <li><a class="cat" href="#">Ofertas</a></li>
              <li><a class="cat" href="/almacen/vacio"></a></li>
            </ul>
          </div>
          <a class="cat" href="https://www.tienda.com.ar/bebidas">Bebidas</a>
        </nav>
        "##;
        let links = parse_menu_links(html, "https://www.tienda.com.ar/", "a.cat").unwrap();
        assert_eq!(
            links,
            vec![
                MenuCategory {
                    name: "Infusiones".into(),
                    url: "https://www.tienda.com.ar/almacen/infusiones".into()
                },
                MenuCategory {
                    name: "Aceites".into(),
                    url: "https://www.tienda.com.ar/almacen/aceites".into()
                },
                MenuCategory {
                    name: "Bebidas".into(),
                    url: "https://www.tienda.com.ar/bebidas".into()
                },
            ]
        );

        let mut all = links.clone();
        assert_eq!(merge_categories(&mut all, links), 0);
        assert!(parse_menu_links(html, "https://x", "a[").is_err());
    }

    #[test]
    fn test_blocked_patterns_cover_images_fonts_and_styles() {
        for ext in ["*.jpg", "*.webp", "*.woff2", "*.ttf", "*.css"] {
            assert!(BLOCKED_RESOURCE_PATTERNS.contains(&ext), "{}", ext);
        }
        assert!(!BLOCKED_RESOURCE_PATTERNS.iter().any(|p| p.ends_with(".js")));
    }

    #[test]
    fn test_invalid_selector_is_an_error() {
        let selectors = CardSelectors {
            item: "div[".to_string(),
            ..CardSelectors::default()
        };
        assert!(parse_cards("<html></html>", "https://x", &selectors, None, None).is_err());
    }
}
