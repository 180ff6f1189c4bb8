//! Relational schema catalog
//!
//! Describes the reference collection (the product master) and the detail
//! collections scanned for orphaned codes. Identifiers are interpolated into
//! SQL, so the catalog validates them before any adapter uses it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid identifier regex"));

/// Returns true when `name` is safe to quote as a SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Join from a detail collection to the header carrying its document date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderJoin {
    pub collection: String,
    /// Column on the detail collection referencing the header
    pub foreign_key: String,
    /// Column on the header matched by `foreign_key`
    pub header_key: String,
    pub date_field: String,
}

/// A paginated detail data set inside a relational store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannableCollection {
    pub name: String,
    pub primary_key: String,
    #[serde(default = "default_code_field")]
    pub code_field: String,
    /// Column holding the product's secondary identifier, when the collection has one
    #[serde(default)]
    pub secondary_key_field: Option<String>,
    #[serde(default)]
    pub description_field: Option<String>,
    /// Header needed for date-range filtering
    #[serde(default)]
    pub header: Option<HeaderJoin>,
}

/// The product master every detail code must resolve against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCollection {
    pub name: String,
    pub primary_key: String,
    #[serde(default = "default_code_field")]
    pub code_field: String,
    pub description_field: String,
    #[serde(default)]
    pub category_field: Option<String>,
    #[serde(default)]
    pub subcategory_field: Option<String>,
    #[serde(default)]
    pub discontinued_field: Option<String>,
}

fn default_code_field() -> String {
    "ProductUPC".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub reference: ReferenceCollection,
    pub collections: Vec<ScannableCollection>,
}

impl SchemaCatalog {
    /// Checks every identifier in the catalog, returning the first offender.
    pub fn validate(&self) -> Result<(), String> {
        let reference = &self.reference;
        let mut names: Vec<&str> = vec![
            reference.name.as_str(),
            reference.primary_key.as_str(),
            reference.code_field.as_str(),
            reference.description_field.as_str(),
        ];
        names.extend(
            [
                &reference.category_field,
                &reference.subcategory_field,
                &reference.discontinued_field,
            ]
            .into_iter()
            .flatten()
            .map(String::as_str),
        );

        for collection in &self.collections {
            names.extend([
                collection.name.as_str(),
                collection.primary_key.as_str(),
                collection.code_field.as_str(),
            ]);
            names.extend(collection.secondary_key_field.as_deref());
            names.extend(collection.description_field.as_deref());
            if let Some(header) = &collection.header {
                names.extend([
                    header.collection.as_str(),
                    header.foreign_key.as_str(),
                    header.header_key.as_str(),
                    header.date_field.as_str(),
                ]);
            }
        }

        match names.into_iter().find(|name| !is_valid_identifier(name)) {
            Some(bad) => Err(format!("invalid identifier in schema catalog: {bad:?}")),
            None => Ok(()),
        }
    }

    pub fn collection(&self, name: &str) -> Option<&ScannableCollection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Names of every collection a code can live in, reference first.
    pub fn searchable_names(&self) -> Vec<&str> {
        std::iter::once(self.reference.name.as_str())
            .chain(self.collections.iter().map(|c| c.name.as_str()))
            .collect()
    }
}

fn detail(name: &str, primary_key: &str, header: Option<(&str, &str, &str)>) -> ScannableCollection {
    ScannableCollection {
        name: name.to_string(),
        primary_key: primary_key.to_string(),
        code_field: default_code_field(),
        secondary_key_field: Some("ProductID".to_string()),
        description_field: Some("ProductDescription".to_string()),
        header: header.map(|(collection, key, date_field)| HeaderJoin {
            collection: collection.to_string(),
            foreign_key: key.to_string(),
            header_key: key.to_string(),
            date_field: date_field.to_string(),
        }),
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self {
            reference: ReferenceCollection {
                name: "Items_tbl".to_string(),
                primary_key: "ProductID".to_string(),
                code_field: default_code_field(),
                description_field: "ProductDescription".to_string(),
                category_field: Some("CategoryID".to_string()),
                subcategory_field: Some("SubCategoryID".to_string()),
                discontinued_field: Some("Discontinued".to_string()),
            },
            collections: vec![
                detail(
                    "QuotationsDetails_tbl",
                    "LineID",
                    Some(("Quotations_tbl", "QuotationID", "QuotationDate")),
                ),
                detail(
                    "PurchaseOrdersDetails_tbl",
                    "LineID",
                    Some(("PurchaseOrders_tbl", "PoID", "PoDate")),
                ),
                detail(
                    "InvoicesDetails_tbl",
                    "LineID",
                    Some(("Invoices_tbl", "InvoiceID", "InvoiceDate")),
                ),
                detail(
                    "CreditMemosDetails_tbl",
                    "LineID",
                    Some(("CreditMemos_tbl", "CmID", "CmDate")),
                ),
                detail(
                    "PurchasesReturnsDetails_tbl",
                    "LineID",
                    Some(("PurchasesReturns_tbl", "ReturnID", "ReturnDate")),
                ),
                detail("QuotationDetails", "id", None),
            ],
        }
    }
}
