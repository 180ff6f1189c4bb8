//! Admin GraphQL documents and response shapes
//!
//! Parsing is kept free of I/O so payload handling is testable offline.

use serde::{Deserialize, Serialize};

use crate::domain::BackendError;

pub const SEARCH_VARIANTS: &str = r"
query searchByBarcode($query: String!, $first: Int!, $after: String) {
  productVariants(first: $first, query: $query, after: $after) {
    edges {
      node {
        id
        barcode
        sku
        title
        product { id title }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}";

pub const BULK_UPDATE_BARCODES: &str = r"
mutation updateVariantBarcodes($productId: ID!, $variants: [ProductVariantsBulkInput!]!) {
  productVariantsBulkUpdate(productId: $productId, variants: $variants) {
    productVariants { id barcode }
    userErrors { field message }
  }
}";

/// Variant title the platform reports for single-variant products
pub const DEFAULT_VARIANT_TITLE: &str = "Default";

#[derive(Debug, Serialize)]
pub struct GraphqlRequest<'a, V: Serialize> {
    pub query: &'a str,
    pub variables: V,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchVariables<'a> {
    pub query: &'a str,
    pub first: u32,
    pub after: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct VariantBarcodeInput<'a> {
    pub id: &'a str,
    pub barcode: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateVariables<'a> {
    pub product_id: &'a str,
    pub variants: Vec<VariantBarcodeInput<'a>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlError {
    pub message: String,
}

impl<T> GraphqlResponse<T> {
    /// Top-level GraphQL errors win over partial data.
    pub fn into_data(self) -> Result<T, BackendError> {
        if !self.errors.is_empty() {
            let messages: Vec<_> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(BackendError::Query(format!("GraphQL errors: {}", messages.join("; "))));
        }
        self.data
            .ok_or_else(|| BackendError::Query("GraphQL response carried no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantSearchData {
    pub product_variants: Connection<VariantNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<N> {
    pub edges: Vec<Edge<N>>,
    pub page_info: PageInfo,
}

impl<N> Connection<N> {
    /// Cursor for the next page, if there is one.
    pub fn next_cursor(&self) -> Option<&str> {
        if self.page_info.has_next_page {
            self.page_info.end_cursor.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Edge<N> {
    pub node: N,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantNode {
    pub id: String,
    pub barcode: Option<String>,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub product: ProductRef,
}

impl VariantNode {
    pub fn variant_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_VARIANT_TITLE)
    }

    /// Product title, qualified by the variant title for multi-variant products.
    pub fn label(&self) -> String {
        let variant = self.variant_title();
        if variant == DEFAULT_VARIANT_TITLE || variant == "Default Title" {
            self.product.title.clone()
        } else {
            format!("{} / {}", self.product.title, variant)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateData {
    pub product_variants_bulk_update: Option<BulkUpdatePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdatePayload {
    #[serde(default)]
    pub product_variants: Option<Vec<UpdatedVariant>>,
    #[serde(default)]
    pub user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatedVariant {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserError {
    pub message: String,
}

impl BulkUpdatePayload {
    /// Variants changed, or the joined user errors.
    pub fn updated_count(&self) -> Result<u64, String> {
        if !self.user_errors.is_empty() {
            let messages: Vec<_> = self.user_errors.iter().map(|e| e.message.as_str()).collect();
            return Err(format!("Update errors: {}", messages.join("; ")));
        }
        Ok(self.product_variants.as_ref().map_or(0, |v| v.len() as u64))
    }
}

fn search_term(code: &str) -> String {
    if code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        format!("barcode:{code}")
    } else {
        format!("barcode:\"{}\"", code.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Search query matching any of `codes`.
pub fn barcode_query(codes: &[String]) -> String {
    codes
        .iter()
        .map(|c| search_term(c))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Trailing numeric segment of a global id such as `gid://shopify/ProductVariant/42`.
pub fn numeric_id(gid: &str) -> Option<u64> {
    gid.rsplit('/').next()?.parse().ok()
}
