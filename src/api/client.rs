//! Catalog query client.
//!
//! One query string combines the spatial-intersection, name-substring, and
//! date-range predicates; pagination follows the server's `@odata.nextLink`
//! until it stops supplying one. A malformed or error response during
//! pagination is fatal to the query phase - there is no retry at this layer.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use super::ApiError;

const CATALOG_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1/Products";

/// One catalog entry. Immutable once fetched; the name doubles as the
/// filename stem for the downloaded archive.
#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ContentDate")]
    pub content_date: ContentDate,
    #[serde(rename = "ContentLength")]
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentDate {
    #[serde(rename = "Start")]
    pub start: String,
}

#[derive(Debug, Deserialize)]
pub struct ProductsPage {
    pub value: Vec<Product>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// Filter predicates for one batch run, built once and never mutated.
#[derive(Debug, Clone)]
pub struct ProductFilter {
    /// Area of interest as a WKT polygon in EPSG:4326 lon/lat
    pub aoi_wkt: String,
    /// Substring matched against the product name
    pub name_contains: String,
    /// First content date included (inclusive)
    pub start_date: NaiveDate,
    /// Last content date included (inclusive; the query bound is one day past)
    pub end_date: NaiveDate,
}

impl ProductFilter {
    /// Assemble the OData `$filter` expression. The temporal upper bound is
    /// exclusive: one day is added to `end_date` so the whole final day is
    /// covered by `ContentDate/Start lt <bound>`.
    pub fn to_odata(&self) -> String {
        let upper = self.end_date + Duration::days(1);
        format!(
            "OData.CSC.Intersects(area=geography'SRID=4326;{}') \
             and contains(Name,'{}') \
             and ContentDate/Start gt {} and ContentDate/Start lt {}",
            self.aoi_wkt,
            self.name_contains,
            day_bound(self.start_date),
            day_bound(upper),
        )
    }
}

fn day_bound(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}

/// One page fetch. Split out as a trait so pagination accumulation can be
/// exercised without a network.
pub trait PageSource {
    async fn fetch_page(&self, url: &str) -> Result<ProductsPage>;
}

/// Catalog client over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct CatalogClient {
    client: Client,
}

impl CatalogClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run the filtered query and accumulate every page into one list,
    /// newest content date first.
    pub async fn search(&self, filter: &ProductFilter, page_size: u32) -> Result<Vec<Product>> {
        let url = Url::parse_with_params(
            CATALOG_URL,
            &[
                ("$filter", filter.to_odata()),
                ("$orderby", "ContentDate/Start desc".to_string()),
                ("$top", page_size.to_string()),
            ],
        )
        .context("Failed to build catalog query URL")?;

        collect_pages(self, url.as_str()).await
    }
}

impl PageSource for CatalogClient {
    async fn fetch_page(&self, url: &str) -> Result<ProductsPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send catalog request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body).into());
        }

        response
            .json()
            .await
            .map_err(ApiError::from)
            .context("Failed to parse catalog response")
    }
}

/// Follow `@odata.nextLink` until the server stops supplying one. The whole
/// candidate list is realized in memory before this returns.
pub async fn collect_pages(source: &impl PageSource, first_url: &str) -> Result<Vec<Product>> {
    let mut products = Vec::new();
    let mut next = Some(first_url.to_string());
    let mut pages = 0usize;

    while let Some(url) = next {
        let page = source.fetch_page(&url).await?;
        pages += 1;
        debug!(page = pages, items = page.value.len(), "catalog page received");
        products.extend(page.value);
        next = page.next_link;
    }

    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn filter_combines_all_three_predicates() {
        let filter = ProductFilter {
            aoi_wkt: "POLYGON((0 0,0 1,1 1,0 0))".to_string(),
            name_contains: "S3A_SL_2_LST".to_string(),
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2020, 1, 3).unwrap(),
        };

        let odata = filter.to_odata();
        assert!(odata
            .starts_with("OData.CSC.Intersects(area=geography'SRID=4326;POLYGON((0 0,0 1,1 1,0 0))')"));
        assert!(odata.contains("contains(Name,'S3A_SL_2_LST')"));
        // End bound is exclusive after the +1 day adjustment
        assert!(odata.contains(
            "ContentDate/Start gt 2020-01-01T00:00:00Z and ContentDate/Start lt 2020-01-04T00:00:00Z"
        ));
    }

    #[test]
    fn page_parses_odata_fields() {
        let page: ProductsPage = serde_json::from_str(
            r#"{
                "value": [{
                    "Id": "abc-123",
                    "Name": "S3A_SL_2_LST_20200101.SEN3",
                    "ContentDate": {"Start": "2020-01-01T10:00:00.000Z"},
                    "ContentLength": 1024
                }],
                "@odata.nextLink": "https://example.com/page2"
            }"#,
        )
        .unwrap();

        assert_eq!(page.value.len(), 1);
        assert_eq!(page.value[0].id, "abc-123");
        assert_eq!(page.value[0].content_length, Some(1024));
        assert_eq!(page.next_link.as_deref(), Some("https://example.com/page2"));
    }

    #[test]
    fn content_length_is_optional() {
        let page: ProductsPage = serde_json::from_str(
            r#"{"value": [{
                "Id": "x",
                "Name": "n",
                "ContentDate": {"Start": "2020-01-01T00:00:00.000Z"}
            }]}"#,
        )
        .unwrap();
        assert_eq!(page.value[0].content_length, None);
        assert!(page.next_link.is_none());
    }

    /// Pages keyed by URL, served as raw JSON so the serde renames are
    /// exercised along the way.
    struct CannedPages(HashMap<&'static str, &'static str>);

    impl PageSource for CannedPages {
        async fn fetch_page(&self, url: &str) -> Result<ProductsPage> {
            let body = self
                .0
                .get(url)
                .ok_or_else(|| anyhow::anyhow!("no canned page for {}", url))?;
            Ok(serde_json::from_str(body)?)
        }
    }

    #[tokio::test]
    async fn pagination_accumulates_all_pages_in_order() {
        let mut pages = HashMap::new();
        pages.insert(
            "p1",
            r#"{"value":[
                {"Id":"1","Name":"a","ContentDate":{"Start":"2020-01-03T00:00:00Z"}},
                {"Id":"2","Name":"b","ContentDate":{"Start":"2020-01-02T00:00:00Z"}}
            ],"@odata.nextLink":"p2"}"#,
        );
        pages.insert(
            "p2",
            r#"{"value":[
                {"Id":"3","Name":"c","ContentDate":{"Start":"2020-01-01T00:00:00Z"}}
            ],"@odata.nextLink":"p3"}"#,
        );
        pages.insert("p3", r#"{"value":[]}"#);

        let products = collect_pages(&CannedPages(pages), "p1").await.unwrap();
        assert_eq!(products.len(), 3);
        let ids: Vec<_> = products.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn pagination_failure_is_fatal() {
        let mut pages = HashMap::new();
        // Second page is missing, simulating an error mid-pagination
        pages.insert(
            "p1",
            r#"{"value":[{"Id":"1","Name":"a","ContentDate":{"Start":"2020-01-01T00:00:00Z"}}],"@odata.nextLink":"gone"}"#,
        );

        let result = collect_pages(&CannedPages(pages), "p1").await;
        assert!(result.is_err());
    }
}
