//! Relational store adapter (SQL Server over TDS via tiberius)
//!
//! One lazily connected bb8 pool per store. Every statement comes from
//! [`sql`], which only ever interpolates catalog identifiers.

pub mod connection;
pub mod sql;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tiberius::{Query, Row, error::Error as TdsError};
use tracing::{debug, instrument, warn};

use crate::application::BackendAdapter;
use crate::domain::{
    BackendError, ComparisonFilters, DateRange, Match, MatchLocation, MatchStrategy,
    OrphanRecord, ParameterBatcher, ReferenceProduct, RelationalConnection, RowReplacement,
    RowUpdateResult, ScannableCollection, SchemaCatalog, Store, StoreId, StoreKind,
    UpdateOutcome, Window,
};
use crate::infrastructure::config::{RelationalConfig, defaults};
use connection::{TdsConnectionManager, TdsPool};
use sql::{Param, Statement};

/// Server errors that mean the store itself is unusable: login failed,
/// database cannot be opened, untrusted login, database unavailable.
const CONNECTIVITY_ERROR_CODES: [u32; 4] = [18456, 4060, 18452, 40613];

/// Maps driver failures onto the adapter taxonomy.
pub fn map_tds_error(error: TdsError) -> BackendError {
    match error {
        TdsError::Server(token) if CONNECTIVITY_ERROR_CODES.contains(&token.code()) => {
            BackendError::Connectivity(token.message().to_string())
        }
        TdsError::Server(token) => BackendError::Query(token.message().to_string()),
        TdsError::Io { .. } | TdsError::Tls(_) | TdsError::Routing { .. } | TdsError::Protocol(_) => {
            BackendError::Connectivity(error.to_string())
        }
        other => BackendError::Query(other.to_string()),
    }
}

/// Failing to obtain a connection is always a connectivity failure.
fn map_pool_error(error: bb8::RunError<TdsError>) -> BackendError {
    match error {
        bb8::RunError::User(e) => BackendError::Connectivity(e.to_string()),
        bb8::RunError::TimedOut => {
            BackendError::Connectivity("timed out waiting for a connection".to_string())
        }
    }
}

fn bound(statement: &Statement) -> Query<'_> {
    let mut query = Query::new(statement.sql.as_str());
    for param in &statement.params {
        match param {
            Param::Text(value) => query.bind(value.as_str()),
            Param::Int(value) => query.bind(*value),
            Param::Date(value) => query.bind(*value),
        }
    }
    query
}

fn int(row: &Row, column: &str) -> Result<Option<i64>, BackendError> {
    row.try_get::<i64, _>(column).map_err(map_tds_error)
}

fn text(row: &Row, column: &str) -> Result<Option<String>, BackendError> {
    Ok(row
        .try_get::<&str, _>(column)
        .map_err(map_tds_error)?
        .map(str::to_string))
}

fn required<T>(value: Option<T>, column: &str) -> Result<T, BackendError> {
    value.ok_or_else(|| BackendError::Query(format!("unexpected NULL in column {column}")))
}

pub struct RelationalAdapter {
    store_id: StoreId,
    store_name: String,
    pool: TdsPool,
    catalog: SchemaCatalog,
    batcher: ParameterBatcher,
}

impl RelationalAdapter {
    /// Builds the adapter without connecting; the first statement opens the pool.
    pub fn new(
        store: &Store,
        connection: &RelationalConnection,
        config: &RelationalConfig,
        parameter_ceiling: usize,
    ) -> Result<Self, BackendError> {
        config.schema.validate().map_err(BackendError::InvalidConfig)?;
        let limit = defaults::RELATIONAL_PARAMETER_LIMIT - defaults::RESERVED_PARAMETERS;
        if parameter_ceiling == 0 || parameter_ceiling > limit {
            return Err(BackendError::InvalidConfig(format!(
                "parameter ceiling {parameter_ceiling} outside 1..={limit}"
            )));
        }

        let pool = TdsConnectionManager::new(connection, config).into_pool(
            connection.max_connections.unwrap_or(config.max_connections),
            Duration::from_secs(config.connect_timeout_secs),
        );

        debug!(
            "Relational adapter ready for store {} ({}:{}/{})",
            store.id, connection.host, connection.port, connection.database
        );

        Ok(Self {
            store_id: store.id,
            store_name: store.name.clone(),
            pool,
            catalog: config.schema.clone(),
            batcher: ParameterBatcher::new(parameter_ceiling),
        })
    }

    async fn fetch_rows(&self, statement: &Statement) -> Result<Vec<Row>, BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let stream = bound(statement)
            .query(&mut *conn)
            .await
            .map_err(map_tds_error)?;
        let rows = stream.into_first_result().await.map_err(map_tds_error)?;
        Ok(rows)
    }

    async fn existing_tables(&self) -> Result<HashSet<String>, BackendError> {
        self.fetch_rows(&sql::table_probe())
            .await?
            .iter()
            .map(|row| required(text(row, "table_name")?, "table_name"))
            .collect()
    }

    async fn fetch_count(&self, statement: &Statement) -> Result<u64, BackendError> {
        let rows = self.fetch_rows(statement).await?;
        let total = match rows.first() {
            Some(row) => int(row, "total")?.unwrap_or(0),
            None => 0,
        };
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let result = bound(statement)
            .execute(&mut *conn)
            .await
            .map_err(map_tds_error)?;
        Ok(result.total())
    }

    /// `(primary key, code field)` for any catalog collection, reference included.
    fn keys_of(&self, collection: &str) -> Option<(&str, &str)> {
        if collection == self.catalog.reference.name {
            let reference = &self.catalog.reference;
            return Some((&reference.primary_key, &reference.code_field));
        }
        self.catalog
            .collection(collection)
            .map(|c| (c.primary_key.as_str(), c.code_field.as_str()))
    }

    fn row_match(&self, code: &str, collection: &str, primary_key_field: &str, key: i64, label: Option<String>) -> Match {
        Match {
            store_id: self.store_id,
            store_name: self.store_name.clone(),
            store_kind: StoreKind::Relational,
            code: code.to_string(),
            label: label
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| "Unknown Product".to_string()),
            location: MatchLocation::Row {
                collection: collection.to_string(),
                primary_key_field: primary_key_field.to_string(),
                primary_key: key,
            },
        }
    }
}

#[async_trait]
impl BackendAdapter for RelationalAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn parameter_ceiling(&self) -> usize {
        self.batcher.ceiling()
    }

    #[instrument(skip(self), fields(store_id = %self.store_id))]
    async fn locate_by_code(&self, code: &str) -> Result<Vec<Match>, BackendError> {
        let present = self.existing_tables().await?;
        let reference = &self.catalog.reference;
        let targets = std::iter::once((
            reference.name.as_str(),
            reference.primary_key.as_str(),
            reference.code_field.as_str(),
            Some(reference.description_field.as_str()),
        ))
        .chain(self.catalog.collections.iter().map(|c| {
            (
                c.name.as_str(),
                c.primary_key.as_str(),
                c.code_field.as_str(),
                c.description_field.as_deref(),
            )
        }));

        let mut matches = Vec::new();
        for (collection, primary_key, code_field, description_field) in targets {
            if !present.contains(collection) {
                debug!("Collection {} absent, skipping", collection);
                continue;
            }
            let statement = sql::locate(collection, primary_key, code_field, description_field, code);
            for row in &self.fetch_rows(&statement).await? {
                let key = required(int(row, "pk")?, "pk")?;
                let label = text(row, "description")?;
                matches.push(self.row_match(code, collection, primary_key, key, label));
            }
        }

        debug!("Located {} rows for code {}", matches.len(), code);
        Ok(matches)
    }

    #[instrument(skip(self, matches), fields(store_id = %self.store_id, matches = matches.len()))]
    async fn replace_code(
        &self,
        old_code: &str,
        new_code: &str,
        matches: &[Match],
    ) -> Result<UpdateOutcome, BackendError> {
        let mut keys_by_collection: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        let mut errors = Vec::new();
        for m in matches {
            match &m.location {
                MatchLocation::Row { collection, primary_key, .. } => {
                    keys_by_collection.entry(collection.as_str()).or_default().push(*primary_key);
                }
                MatchLocation::Variant { variant_id, .. } => {
                    errors.push(format!("variant {variant_id} is not a row in this store"));
                }
            }
        }

        let mut updated = 0;
        for (collection, mut keys) in keys_by_collection {
            let Some((primary_key, code_field)) = self.keys_of(collection) else {
                errors.push(format!("{collection}: unknown collection"));
                continue;
            };
            keys.sort_unstable();
            keys.dedup();
            for batch in self.batcher.split(&keys) {
                let statement = sql::replace_batch(collection, primary_key, code_field, new_code, old_code, batch);
                match self.execute(&statement).await {
                    Ok(count) => updated += count,
                    Err(e) => {
                        warn!("Replace in {} failed: {}", collection, e);
                        errors.push(format!("{collection}: {e}"));
                        break;
                    }
                }
            }
        }

        Ok(UpdateOutcome::from_parts(self.store_id, &self.store_name, updated, &errors))
    }

    async fn list_scannable_collections(&self) -> Result<Vec<ScannableCollection>, BackendError> {
        let present = self.existing_tables().await?;
        Ok(self
            .catalog
            .collections
            .iter()
            .filter(|c| {
                let exists = present.contains(&c.name);
                if !exists {
                    debug!("Collection {} absent from store {}", c.name, self.store_id);
                }
                exists
            })
            .cloned()
            .collect())
    }

    #[instrument(skip(self, collection), fields(collection = %collection.name))]
    async fn count_rows(&self, collection: &ScannableCollection, range: &DateRange) -> Result<u64, BackendError> {
        self.fetch_count(&sql::count_rows(collection, range)).await
    }

    #[instrument(skip(self, collection), fields(collection = %collection.name, window_index = window.index))]
    async fn scan_orphans_window(
        &self,
        collection: &ScannableCollection,
        window: Window,
        range: &DateRange,
    ) -> Result<Vec<OrphanRecord>, BackendError> {
        let statement = sql::orphan_window(&self.catalog.reference, collection, window, range);
        self.fetch_rows(&statement)
            .await?
            .iter()
            .map(|row| -> Result<OrphanRecord, BackendError> {
                Ok(OrphanRecord {
                    store_id: self.store_id,
                    collection: collection.name.clone(),
                    primary_key: required(int(row, "pk")?, "pk")?,
                    code: required(text(row, "code")?, "code")?,
                    secondary_key: text(row, "secondary_key")?,
                    description: text(row, "description")?,
                })
            })
            .collect()
    }

    async fn existence_batch_check(&self, codes: &[String]) -> Result<HashSet<String>, BackendError> {
        if codes.is_empty() {
            return Ok(HashSet::new());
        }
        if codes.len() > self.batcher.ceiling() {
            return Err(BackendError::ProtocolLimit {
                requested: codes.len(),
                ceiling: self.batcher.ceiling(),
            });
        }
        let statement = sql::existence(&self.catalog.reference, codes);
        self.fetch_rows(&statement)
            .await?
            .iter()
            .map(|row| required(text(row, "code")?, "code"))
            .collect()
    }

    async fn secondary_match_lookup(
        &self,
        strategy: MatchStrategy,
        record: &OrphanRecord,
    ) -> Result<Option<String>, BackendError> {
        let Some(value) = strategy.lookup_value(record) else {
            return Ok(None);
        };
        let reference = &self.catalog.reference;
        let statement = match strategy {
            MatchStrategy::SecondaryKey => sql::lookup_by_secondary_key(reference, value),
            MatchStrategy::Description => sql::lookup_by_description(reference, value),
        };
        match self.fetch_rows(&statement).await?.first() {
            Some(row) => text(row, "code"),
            None => Ok(None),
        }
    }

    async fn count_products(&self, filters: &ComparisonFilters) -> Result<u64, BackendError> {
        let statement = sql::count_products(&self.catalog.reference, filters);
        if statement.params.len() > defaults::RELATIONAL_PARAMETER_LIMIT {
            return Err(BackendError::ProtocolLimit {
                requested: statement.params.len(),
                ceiling: defaults::RELATIONAL_PARAMETER_LIMIT,
            });
        }
        self.fetch_count(&statement).await
    }

    #[instrument(skip(self, filters), fields(window_index = window.index))]
    async fn products_window(
        &self,
        filters: &ComparisonFilters,
        window: Window,
    ) -> Result<Vec<ReferenceProduct>, BackendError> {
        let statement = sql::products_window(&self.catalog.reference, filters, window);
        self.fetch_rows(&statement)
            .await?
            .iter()
            .map(|row| -> Result<ReferenceProduct, BackendError> {
                Ok(ReferenceProduct {
                    primary_key: required(int(row, "pk")?, "pk")?,
                    code: required(text(row, "code")?, "code")?,
                    description: text(row, "description")?,
                    category_id: int(row, "category_id")?,
                    subcategory_id: int(row, "subcategory_id")?,
                    discontinued: row
                        .try_get::<bool, _>("discontinued")
                        .map_err(map_tds_error)?
                        .unwrap_or(false),
                })
            })
            .collect()
    }

    #[instrument(skip(self, rows), fields(store_id = %self.store_id, rows = rows.len()))]
    async fn replace_rows(&self, rows: &[RowReplacement]) -> Result<Vec<RowUpdateResult>, BackendError> {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let outcome = match self.keys_of(&row.collection) {
                None => Err("unknown collection".to_string()),
                Some((primary_key, code_field)) => {
                    let statement = sql::replace_row(
                        &row.collection,
                        primary_key,
                        code_field,
                        row.primary_key,
                        &row.orphaned_code,
                        &row.replacement_code,
                    );
                    match self.execute(&statement).await {
                        Ok(0) => Err("row not found or code already changed".to_string()),
                        Ok(_) => Ok(()),
                        Err(e) => Err(e.to_string()),
                    }
                }
            };
            results.push(RowUpdateResult {
                collection: row.collection.clone(),
                primary_key: row.primary_key,
                success: outcome.is_ok(),
                error: outcome.err(),
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StoreConnection;

    fn store() -> (Store, RelationalConnection) {
        let connection = RelationalConnection {
            host: "127.0.0.1".into(),
            port: 1,
            database: "erp".into(),
            username: "u".into(),
            password: "p".into(),
            max_connections: Some(1),
        };
        let store = Store {
            id: StoreId(7),
            name: "ERP".into(),
            active: true,
            connection: StoreConnection::Relational(connection.clone()),
        };
        (store, connection)
    }

    #[test]
    fn driver_errors_map_to_taxonomy() {
        let refused = TdsError::Io {
            kind: std::io::ErrorKind::ConnectionRefused,
            message: "connection refused".into(),
        };
        assert!(map_tds_error(refused).is_connectivity_class());
        assert!(map_tds_error(TdsError::Tls("handshake failed".into())).is_connectivity_class());
        assert!(matches!(
            map_tds_error(TdsError::Conversion("bad column".into())),
            BackendError::Query(_)
        ));
        assert!(map_pool_error(bb8::RunError::TimedOut).is_connectivity_class());
    }

    #[tokio::test]
    async fn rejects_ceiling_above_protocol_limit() {
        let (store, connection) = store();
        let result = RelationalAdapter::new(
            &store,
            &connection,
            &RelationalConfig::default(),
            defaults::RELATIONAL_PARAMETER_LIMIT,
        );
        assert!(matches!(result, Err(BackendError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn oversized_existence_batch_is_refused_before_io() {
        let (store, connection) = store();
        let adapter =
            RelationalAdapter::new(&store, &connection, &RelationalConfig::default(), 2).unwrap();
        let codes = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let result = adapter.existence_batch_check(&codes).await;
        assert_eq!(
            result,
            Err(BackendError::ProtocolLimit {
                requested: 3,
                ceiling: 2
            })
        );
        assert!(adapter.existence_batch_check(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_without_key_skips_the_backend() {
        let (store, connection) = store();
        let adapter =
            RelationalAdapter::new(&store, &connection, &RelationalConfig::default(), 10).unwrap();
        let record = OrphanRecord {
            store_id: StoreId(7),
            collection: "InvoicesDetails_tbl".into(),
            primary_key: 1,
            code: "x".into(),
            secondary_key: None,
            description: Some("  ".into()),
        };
        assert_eq!(
            adapter.secondary_match_lookup(MatchStrategy::SecondaryKey, &record).await,
            Ok(None)
        );
        assert_eq!(
            adapter.secondary_match_lookup(MatchStrategy::Description, &record).await,
            Ok(None)
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connectivity_failure() {
        let (store, connection) = store();
        let config = RelationalConfig {
            connect_timeout_secs: 1,
            ..RelationalConfig::default()
        };
        let adapter = RelationalAdapter::new(&store, &connection, &config, 10).unwrap();
        let result = adapter.locate_by_code("012345678905").await;
        assert!(matches!(result, Err(e) if e.is_connectivity_class()));
    }
}
