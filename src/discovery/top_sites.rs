use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

use super::{Discovery, DiscoveryError, Partition};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Scrapes a top-sites index: a country list, then one listing per country
///
/// The country index lives at `<base>countries` and links each country with
/// an `a` inside `ul.countries li`. A country listing names its sites in
/// `.DescriptionCell a`.
#[derive(Debug, Clone)]
pub struct TopSitesScraper {
    client: Client,
    base: Url,
}

impl TopSitesScraper {
    pub fn new(base_url: &str) -> Result<Self, DiscoveryError> {
        let base = Url::parse(base_url)
            .map_err(|e| DiscoveryError::Fatal(format!("Invalid top sites URL: {}", e)))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::Fatal(e.to_string()))?;

        Ok(Self { client, base })
    }

    fn join(&self, href: &str) -> Result<Url, DiscoveryError> {
        self.base
            .join(href)
            .map_err(|e| DiscoveryError::Fatal(format!("Invalid link '{}': {}", href, e)))
    }

    async fn fetch_page(&self, url: Url) -> Result<String, DiscoveryError> {
        debug!(%url, "Fetching listing page");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DiscoveryError::Transient(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{} returned HTTP {}", url, status.as_u16());
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                DiscoveryError::Transient(message)
            } else {
                DiscoveryError::Fatal(message)
            });
        }

        response
            .text()
            .await
            .map_err(|e| DiscoveryError::Transient(format!("{}: {}", url, e)))
    }
}

fn selector(css: &str) -> Result<Selector, DiscoveryError> {
    Selector::parse(css).map_err(|e| DiscoveryError::Fatal(format!("Bad selector '{}': {}", css, e)))
}

/// `(country, href)` pairs from the country index; spaces in names become `_`
pub fn parse_countries(html: &str) -> Result<Vec<(String, String)>, DiscoveryError> {
    let items = selector("ul.countries li")?;
    let link = selector("a")?;
    let document = Html::parse_document(html);

    Ok(document
        .select(&items)
        .filter_map(|li| li.select(&link).next())
        .filter_map(|a| {
            let name = a.text().collect::<String>();
            let name = name.trim();
            let href = a.value().attr("href")?;
            if name.is_empty() {
                return None;
            }
            Some((name.replace(' ', "_"), href.to_string()))
        })
        .collect())
}

/// Site URLs from a country listing, lowercased and prefixed with `https://`
pub fn parse_sites(html: &str) -> Result<Vec<String>, DiscoveryError> {
    let cells = selector(".DescriptionCell a")?;
    let document = Html::parse_document(html);

    Ok(document
        .select(&cells)
        .map(|a| a.text().collect::<String>().trim().to_lowercase())
        .filter(|site| !site.is_empty())
        .map(|site| format!("https://{}", site))
        .collect())
}

#[async_trait]
impl Discovery for TopSitesScraper {
    async fn discover(&self) -> Result<Vec<Partition>, DiscoveryError> {
        info!(base = %self.base, "Scraping country list");
        let index = self.fetch_page(self.join("countries")?).await?;
        let countries = parse_countries(&index)?;
        info!(countries = countries.len(), "Got list of countries, scraping individual pages");

        let mut partitions = Vec::with_capacity(countries.len());
        for (country, href) in countries {
            let listing = self.fetch_page(self.join(&href)?).await?;
            let sites = parse_sites(&listing)?;
            info!(country = %country, sites = sites.len(), "Got list of sites");
            partitions.push(Partition::new(country, sites));
        }

        Ok(partitions)
    }
}
