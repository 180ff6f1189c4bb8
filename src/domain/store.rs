//! Store entities
//!
//! A store is one remote target the engine fans work out to. Stores are owned
//! by the registry; orchestrators only ever see a cloned snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// Registry identifier of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(transparent)]
pub struct StoreId(pub i64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    Relational,
    CommerceApi,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational => f.write_str("relational"),
            Self::CommerceApi => f.write_str("commerce-api"),
        }
    }
}

/// Connection parameters for a relational store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalConnection {
    pub host: String,
    #[serde(default = "default_relational_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Overrides the engine-wide pool size for this store
    #[serde(default)]
    pub max_connections: Option<u32>,
}

const fn default_relational_port() -> u16 {
    1433
}

impl fmt::Debug for RelationalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Connection parameters for a hosted commerce platform store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommerceConnection {
    /// Shop domain as entered by the operator; normalized by the adapter
    pub shop_domain: String,
    pub access_token: String,
    /// Admin API version, engine default when absent
    #[serde(default)]
    pub api_version: Option<String>,
    /// Also overwrite the variant SKU with the new barcode on update
    #[serde(default)]
    pub update_sku_with_barcode: bool,
}

impl fmt::Debug for CommerceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommerceConnection")
            .field("shop_domain", &self.shop_domain)
            .field("access_token", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .field("update_sku_with_barcode", &self.update_sku_with_barcode)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StoreConnection {
    Relational(RelationalConnection),
    CommerceApi(CommerceConnection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub connection: StoreConnection,
}

const fn default_active() -> bool {
    true
}

impl Store {
    pub const fn kind(&self) -> StoreKind {
        match self.connection {
            StoreConnection::Relational(_) => StoreKind::Relational,
            StoreConnection::CommerceApi(_) => StoreKind::CommerceApi,
        }
    }

    pub const fn is_relational(&self) -> bool {
        matches!(self.kind(), StoreKind::Relational)
    }
}
