//! Hosted commerce platform adapter
//!
//! Talks to the Admin GraphQL API (and the REST variant endpoint when SKUs
//! follow barcodes). Requests share one client and one direct rate limiter
//! per store; HTTP 429 is retried with jittered backoff.

pub mod graphql;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{
    Client, RequestBuilder, Response, StatusCode,
    header::{CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER},
};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::application::BackendAdapter;
use crate::domain::{
    BackendError, CommerceConnection, Match, MatchLocation, Store, StoreId, StoreKind,
    UpdateOutcome,
};
use crate::infrastructure::config::CommerceConfig;
use graphql::{
    BULK_UPDATE_BARCODES, BulkUpdateData, BulkUpdateVariables, GraphqlRequest, GraphqlResponse,
    SEARCH_VARIANTS, SearchVariables, VariantBarcodeInput, VariantNode, VariantSearchData,
};

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const PLATFORM_SUFFIX: &str = ".myshopify.com";
const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Reduces the operator's entry to a bare host, completes bare shop names
/// and rejects any other host.
pub fn normalize_shop_domain(raw: &str) -> Result<String, BackendError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BackendError::InvalidConfig("shop domain is required".to_string()));
    }
    let invalid = || {
        BackendError::InvalidConfig(format!(
            "invalid shop domain {raw:?}, expected storename{PLATFORM_SUFFIX}"
        ))
    };

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&with_scheme).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "https" | "http") || !parsed.path().trim_matches('/').is_empty() {
        return Err(invalid());
    }
    let host = parsed.host_str().ok_or_else(invalid)?.to_lowercase();

    if host.ends_with(PLATFORM_SUFFIX) && host.len() > PLATFORM_SUFFIX.len() {
        return Ok(host);
    }
    if !host.contains('.') {
        return Ok(format!("{host}{PLATFORM_SUFFIX}"));
    }
    Err(invalid())
}

/// Delay before retry `attempt` (1-based), honoring a server hint.
fn retry_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint;
    }
    let exp = BASE_BACKOFF_MS.saturating_mul(1 << attempt.min(6));
    Duration::from_millis(exp.min(MAX_BACKOFF_MS) + fastrand::u64(0..=250))
}

fn retry_after_hint(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn transport_error(error: &reqwest::Error) -> BackendError {
    BackendError::Connectivity(format!("request failed: {error}"))
}

pub struct CommerceAdapter {
    store_id: StoreId,
    store_name: String,
    base_url: String,
    update_sku_with_barcode: bool,
    client: Client,
    limiter: DefaultDirectRateLimiter,
    max_retries: u32,
    page_size: u32,
    existence_ceiling: usize,
}

impl CommerceAdapter {
    pub fn new(
        store: &Store,
        connection: &CommerceConnection,
        config: &CommerceConfig,
    ) -> Result<Self, BackendError> {
        let domain = normalize_shop_domain(&connection.shop_domain)?;
        let api_version = connection
            .api_version
            .as_deref()
            .unwrap_or(&config.api_version);

        let mut token = HeaderValue::from_str(&connection.access_token)
            .map_err(|_| BackendError::InvalidConfig("access token is not a valid header value".into()))?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, token);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| BackendError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        let quota = Quota::per_second(NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            store_id: store.id,
            store_name: store.name.clone(),
            base_url: format!("https://{domain}/admin/api/{api_version}"),
            update_sku_with_barcode: connection.update_sku_with_barcode,
            client,
            limiter: RateLimiter::direct(quota),
            max_retries: config.max_retries,
            page_size: config.page_size.clamp(1, 250),
            existence_ceiling: config.existence_ceiling.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a request, waiting on the rate limiter before every attempt.
    /// 429 and 5xx are retried; 401/403 and exhausted retries are
    /// connectivity failures.
    async fn send(&self, build: impl Fn() -> RequestBuilder + Send + Sync) -> Result<Response, BackendError> {
        let mut attempt = 0;
        loop {
            self.limiter.until_ready().await;
            attempt += 1;

            let response = match build().send().await {
                Ok(response) => response,
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt <= self.max_retries => {
                    warn!("Transport error on attempt {}: {}", attempt, e);
                    tokio::time::sleep(retry_delay(attempt, None)).await;
                    continue;
                }
                Err(e) => return Err(transport_error(&e)),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt <= self.max_retries {
                let delay = retry_delay(attempt, retry_after_hint(&response));
                debug!("HTTP {} from {}, retrying in {:?}", status, self.base_url, delay);
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {}", body.chars().take(500).collect::<String>());
            return Err(
                if retryable || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    BackendError::Connectivity(message)
                } else {
                    BackendError::Query(message)
                },
            );
        }
    }

    async fn graphql<V, T>(&self, query: &str, variables: V) -> Result<T, BackendError>
    where
        V: Serialize + Send + Sync,
        T: DeserializeOwned + Send,
    {
        let url = format!("{}/graphql.json", self.base_url);
        let body = GraphqlRequest { query, variables };
        let response = self.send(|| self.client.post(&url).json(&body)).await?;
        let parsed: GraphqlResponse<T> = response
            .json()
            .await
            .map_err(|e| BackendError::Query(format!("unreadable GraphQL response: {e}")))?;
        parsed.into_data()
    }

    /// Every variant matching `search`, following cursor pages.
    async fn search_variants(&self, search: &str) -> Result<Vec<VariantNode>, BackendError> {
        let mut variants = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let variables = SearchVariables {
                query: search,
                first: self.page_size,
                after: cursor.as_deref(),
            };
            let data: VariantSearchData = self.graphql(SEARCH_VARIANTS, variables).await?;
            let connection = data.product_variants;
            let next = connection.next_cursor().map(str::to_string);
            variants.extend(connection.edges.into_iter().map(|edge| edge.node));
            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(variants),
            }
        }
    }

    async fn bulk_update_product(&self, product_id: &str, variant_ids: &[&str], new_code: &str) -> Result<u64, String> {
        let variables = BulkUpdateVariables {
            product_id,
            variants: variant_ids
                .iter()
                .map(|&id| VariantBarcodeInput { id, barcode: new_code })
                .collect(),
        };
        let data: BulkUpdateData = self
            .graphql(BULK_UPDATE_BARCODES, variables)
            .await
            .map_err(|e| e.to_string())?;
        data.product_variants_bulk_update
            .ok_or_else(|| "empty mutation payload".to_string())?
            .updated_count()
    }

    /// REST write of barcode and SKU together.
    async fn put_variant(&self, variant_id: &str, new_code: &str) -> Result<(), String> {
        let numeric = graphql::numeric_id(variant_id).ok_or_else(|| format!("malformed variant id {variant_id}"))?;
        let url = format!("{}/variants/{numeric}.json", self.base_url);
        let payload = serde_json::json!({
            "variant": { "id": numeric, "barcode": new_code, "sku": new_code }
        });
        self.send(|| self.client.put(&url).json(&payload))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl BackendAdapter for CommerceAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::CommerceApi
    }

    fn parameter_ceiling(&self) -> usize {
        self.existence_ceiling
    }

    #[instrument(skip(self), fields(store_id = %self.store_id))]
    async fn locate_by_code(&self, code: &str) -> Result<Vec<Match>, BackendError> {
        let variants = self.search_variants(&graphql::barcode_query(&[code.to_string()])).await?;
        let matches: Vec<Match> = variants
            .into_iter()
            // the platform's search is tokenized, keep exact barcodes only
            .filter(|v| v.barcode.as_deref().map(str::trim) == Some(code))
            .map(|v| Match {
                store_id: self.store_id,
                store_name: self.store_name.clone(),
                store_kind: StoreKind::CommerceApi,
                code: code.to_string(),
                label: v.label(),
                location: MatchLocation::Variant {
                    variant_title: v.variant_title().to_string(),
                    product_id: v.product.id,
                    product_title: v.product.title,
                    variant_id: v.id,
                    sku: v.sku,
                },
            })
            .collect();
        debug!("Located {} variants for code {}", matches.len(), code);
        Ok(matches)
    }

    #[instrument(skip(self, matches), fields(store_id = %self.store_id, matches = matches.len()))]
    async fn replace_code(
        &self,
        _old_code: &str,
        new_code: &str,
        matches: &[Match],
    ) -> Result<UpdateOutcome, BackendError> {
        let mut by_product: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut errors = Vec::new();
        for m in matches {
            match &m.location {
                MatchLocation::Variant { product_id, variant_id, .. } => {
                    by_product.entry(product_id.as_str()).or_default().push(variant_id.as_str());
                }
                MatchLocation::Row { collection, primary_key, .. } => {
                    errors.push(format!("row {collection}#{primary_key} is not a variant in this store"));
                }
            }
        }

        let mut updated = 0;
        for (product_id, variant_ids) in by_product {
            if self.update_sku_with_barcode {
                for variant_id in variant_ids {
                    match self.put_variant(variant_id, new_code).await {
                        Ok(()) => updated += 1,
                        Err(e) => errors.push(format!("Variant {variant_id}: {e}")),
                    }
                }
            } else {
                match self.bulk_update_product(product_id, &variant_ids, new_code).await {
                    Ok(count) => updated += count,
                    Err(e) => errors.push(format!("Product {product_id}: {e}")),
                }
            }
        }

        Ok(UpdateOutcome::from_parts(self.store_id, &self.store_name, updated, &errors))
    }

    async fn existence_batch_check(&self, codes: &[String]) -> Result<HashSet<String>, BackendError> {
        if codes.is_empty() {
            return Ok(HashSet::new());
        }
        if codes.len() > self.existence_ceiling {
            return Err(BackendError::ProtocolLimit {
                requested: codes.len(),
                ceiling: self.existence_ceiling,
            });
        }
        let wanted: HashSet<&str> = codes.iter().map(String::as_str).collect();
        let variants = self.search_variants(&graphql::barcode_query(codes)).await?;
        Ok(variants
            .into_iter()
            .filter_map(|v| v.barcode)
            .map(|b| b.trim().to_string())
            .filter(|b| wanted.contains(b.as_str()))
            .collect())
    }
}
