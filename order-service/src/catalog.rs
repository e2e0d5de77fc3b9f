use serde::Deserialize;
use tracing::warn;

/// Availability snapshot returned by the catalog service. A stale read by the
/// time the order is admitted, never a reservation.
#[derive(Debug, Clone)]
pub struct StockInfo {
    pub stock: i32,
    pub available: bool,
    pub price: f64,
}

#[derive(Debug, Deserialize)]
struct StockSnapshot {
    stock: i32,
    available: bool,
}

#[derive(Clone)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Two sequential reads: stock+availability, then price. Not atomic with
    /// respect to each other or to the eventual decrement. Any transport
    /// failure or non-success status yields `None`: cannot verify, reject.
    pub async fn check_availability(&self, product_id: i32) -> Option<StockInfo> {
        let url = format!("{}/internal/products/{product_id}/stock", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("catalog unreachable checking stock for product {product_id}: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                "catalog returned {} for product {product_id} stock",
                response.status()
            );
            return None;
        }
        let snapshot: StockSnapshot = match response.json().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("undecodable stock snapshot for product {product_id}: {e}");
                return None;
            }
        };

        // The price lives on the product resource, not the stock endpoint.
        let url = format!("{}/products/{product_id}", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("catalog unreachable fetching product {product_id}: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                "catalog returned {} for product {product_id}",
                response.status()
            );
            return None;
        }
        let product: serde_json::Value = match response.json().await {
            Ok(product) => product,
            Err(e) => {
                warn!("undecodable product body for product {product_id}: {e}");
                return None;
            }
        };
        let Some(price) = product.get("price").and_then(|p| p.as_f64()) else {
            warn!("product {product_id} has no numeric price");
            return None;
        };

        Some(StockInfo {
            stock: snapshot.stock,
            available: snapshot.available,
            price,
        })
    }
}
