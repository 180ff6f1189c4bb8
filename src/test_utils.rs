//! Test utilities for Global UPC
//!
//! In-memory stand-ins for every collaborator port so orchestrators can be
//! exercised without a database server or a commerce account, plus fixtures
//! for stores and an isolated SQLite database.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::application::{
    AdapterFactory, BackendAdapter, EngineSettings, ExclusionStore, HistoryRecorder,
    ReconciliationEngine,
};
use crate::domain::{
    BackendError, CommerceConnection, ComparisonFilters, DateRange, Match, MatchLocation,
    MatchStrategy, OrphanRecord, ProgressEvent, ReferenceProduct, RelationalConnection,
    RowReplacement, RowUpdateResult, ScannableCollection, Store, StoreConnection, StoreId,
    StoreKind, UpdateBatch, UpdateOutcome, Window,
};
use crate::infrastructure::{DatabaseConnection, StaticStoreRegistry};

/// Name of the reference collection inside an [`InMemoryBackend`]
pub const REFERENCE_COLLECTION: &str = "Items_tbl";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test database configuration
pub struct TestDatabase {
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    /// Fresh, migrated in-memory database; every test gets its own.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            connection: DatabaseConnection::in_memory().await?,
        })
    }

    pub fn pool(&self) -> sqlx::SqlitePool {
        self.connection.pool().clone()
    }
}

pub fn relational_store(id: i64, name: &str) -> Store {
    Store {
        id: StoreId(id),
        name: name.to_string(),
        active: true,
        connection: StoreConnection::Relational(RelationalConnection {
            host: "localhost".to_string(),
            port: 1433,
            database: format!("store_{id}"),
            username: "test".to_string(),
            password: "test".to_string(),
            max_connections: None,
        }),
    }
}

pub fn commerce_store(id: i64, name: &str) -> Store {
    Store {
        id: StoreId(id),
        name: name.to_string(),
        active: true,
        connection: StoreConnection::CommerceApi(CommerceConnection {
            shop_domain: format!("shop-{id}.example.com"),
            access_token: "test-token".to_string(),
            api_version: None,
            update_sku_with_barcode: false,
        }),
    }
}

/// Detail collection without a header, named as given.
pub fn collection(name: &str) -> ScannableCollection {
    ScannableCollection {
        name: name.to_string(),
        primary_key: "ID".to_string(),
        code_field: "ProductUPC".to_string(),
        secondary_key_field: Some("ProductID".to_string()),
        description_field: Some("ProductDescription".to_string()),
        header: None,
    }
}

pub fn product(primary_key: i64, code: &str, description: &str) -> ReferenceProduct {
    ReferenceProduct {
        primary_key,
        code: code.to_string(),
        description: Some(description.to_string()),
        category_id: None,
        subcategory_id: None,
        discontinued: false,
    }
}

/// One row of a detail collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRow {
    pub primary_key: i64,
    pub code: String,
    pub secondary_key: Option<String>,
    pub description: Option<String>,
    pub date: Option<chrono::NaiveDate>,
}

impl MemoryRow {
    pub fn new(primary_key: i64, code: &str) -> Self {
        Self {
            primary_key,
            code: code.to_string(),
            secondary_key: None,
            description: None,
            date: None,
        }
    }

    pub fn with_secondary_key(mut self, key: &str) -> Self {
        self.secondary_key = Some(key.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn dated(mut self, date: chrono::NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

/// One commerce variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryVariant {
    pub product_id: String,
    pub product_title: String,
    pub variant_id: String,
    pub barcode: String,
}

#[derive(Default)]
struct BackendState {
    reference: Vec<ReferenceProduct>,
    collections: Vec<(ScannableCollection, Vec<MemoryRow>)>,
    variants: Vec<MemoryVariant>,
    locate_error: Option<BackendError>,
    replace_error: Option<BackendError>,
    existence_error: Option<BackendError>,
    /// Collection and window index whose scan fails
    scan_error: Option<(String, usize, BackendError)>,
    cancel_on_count: Option<(String, CancellationToken)>,
    cancel_on_replace: Option<CancellationToken>,
    scan_gate: Option<Arc<Notify>>,
    existence_batches: Vec<usize>,
    locate_calls: usize,
}

/// Backend adapter over plain vectors.
///
/// Relational backends resolve codes against their reference products and
/// detail rows; commerce backends against their variants.
pub struct InMemoryBackend {
    store_id: StoreId,
    store_name: String,
    kind: StoreKind,
    ceiling: usize,
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    pub fn for_store(store: &Store) -> Self {
        Self {
            store_id: store.id,
            store_name: store.name.clone(),
            kind: store.kind(),
            ceiling: 2000,
            state: Mutex::new(BackendState::default()),
        }
    }

    fn state_mut(&mut self) -> &mut BackendState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_products(mut self, products: impl IntoIterator<Item = ReferenceProduct>) -> Self {
        self.state_mut().reference.extend(products);
        self
    }

    pub fn with_collection(mut self, collection: ScannableCollection, rows: Vec<MemoryRow>) -> Self {
        self.state_mut().collections.push((collection, rows));
        self
    }

    pub fn with_variant(mut self, product_id: &str, product_title: &str, variant_id: &str, barcode: &str) -> Self {
        self.state_mut().variants.push(MemoryVariant {
            product_id: product_id.to_string(),
            product_title: product_title.to_string(),
            variant_id: variant_id.to_string(),
            barcode: barcode.to_string(),
        });
        self
    }

    pub fn failing_locate(mut self, error: BackendError) -> Self {
        self.state_mut().locate_error = Some(error);
        self
    }

    pub fn failing_replace(mut self, error: BackendError) -> Self {
        self.state_mut().replace_error = Some(error);
        self
    }

    pub fn failing_existence(mut self, error: BackendError) -> Self {
        self.state_mut().existence_error = Some(error);
        self
    }

    pub fn failing_scan(mut self, collection: &str, window_index: usize, error: BackendError) -> Self {
        self.state_mut().scan_error = Some((collection.to_string(), window_index, error));
        self
    }

    /// Cancels `token` when `collection` is about to be counted.
    pub fn cancel_when_counting(&self, collection: &str, token: CancellationToken) {
        lock(&self.state).cancel_on_count = Some((collection.to_string(), token));
    }

    /// Cancels `token` once the next code replacement has been applied.
    pub fn cancel_after_replacing(&self, token: CancellationToken) {
        lock(&self.state).cancel_on_replace = Some(token);
    }

    /// Every window scan waits for one notification on `gate` first.
    pub fn hold_scans(mut self, gate: Arc<Notify>) -> Self {
        self.state_mut().scan_gate = Some(gate);
        self
    }

    /// Size of every existence batch received so far.
    pub fn existence_batches(&self) -> Vec<usize> {
        lock(&self.state).existence_batches.clone()
    }

    pub fn locate_calls(&self) -> usize {
        lock(&self.state).locate_calls
    }

    /// Current code of a detail or reference row.
    pub fn row_code(&self, collection: &str, primary_key: i64) -> Option<String> {
        let state = lock(&self.state);
        if collection == REFERENCE_COLLECTION {
            return state
                .reference
                .iter()
                .find(|p| p.primary_key == primary_key)
                .map(|p| p.code.clone());
        }
        state
            .collections
            .iter()
            .find(|(c, _)| c.name == collection)
            .and_then(|(_, rows)| rows.iter().find(|r| r.primary_key == primary_key))
            .map(|r| r.code.clone())
    }

    pub fn variant_barcode(&self, variant_id: &str) -> Option<String> {
        lock(&self.state)
            .variants
            .iter()
            .find(|v| v.variant_id == variant_id)
            .map(|v| v.barcode.clone())
    }

    fn row_match(&self, collection: &str, primary_key: i64, code: &str, label: Option<&str>) -> Match {
        Match {
            store_id: self.store_id,
            store_name: self.store_name.clone(),
            store_kind: self.kind,
            code: code.to_string(),
            label: label.unwrap_or("Unknown Product").to_string(),
            location: MatchLocation::Row {
                collection: collection.to_string(),
                primary_key_field: "ID".to_string(),
                primary_key,
            },
        }
    }

    fn variant_match(&self, variant: &MemoryVariant) -> Match {
        Match {
            store_id: self.store_id,
            store_name: self.store_name.clone(),
            store_kind: self.kind,
            code: variant.barcode.clone(),
            label: variant.product_title.clone(),
            location: MatchLocation::Variant {
                product_id: variant.product_id.clone(),
                product_title: variant.product_title.clone(),
                variant_id: variant.variant_id.clone(),
                variant_title: "Default".to_string(),
                sku: None,
            },
        }
    }

    fn in_range(collection: &ScannableCollection, row: &MemoryRow, range: &DateRange) -> bool {
        if collection.header.is_none() || range.is_unbounded() {
            return true;
        }
        let Some(date) = row.date else {
            return false;
        };
        range.from.is_none_or(|from| date >= from) && range.to.is_none_or(|to| date <= to)
    }

    /// Rows of `collection` with a non-empty code inside `range`, ordered by key.
    fn scannable_rows(state: &BackendState, collection: &str, range: &DateRange) -> Result<Vec<MemoryRow>, BackendError> {
        let (definition, rows) = state
            .collections
            .iter()
            .find(|(c, _)| c.name == collection)
            .ok_or_else(|| BackendError::Query(format!("unknown collection {collection}")))?;
        let mut rows: Vec<MemoryRow> = rows
            .iter()
            .filter(|r| !r.code.trim().is_empty() && Self::in_range(definition, r, range))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.primary_key);
        Ok(rows)
    }

    fn filtered_products(state: &BackendState, filters: &ComparisonFilters) -> Vec<ReferenceProduct> {
        let mut products: Vec<ReferenceProduct> = state
            .reference
            .iter()
            .filter(|p| !p.code.trim().is_empty())
            .filter(|p| filters.include_discontinued || !p.discontinued)
            .filter(|p| {
                filters.category_ids.is_empty()
                    || p.category_id.is_some_and(|c| filters.category_ids.contains(&c))
            })
            .filter(|p| {
                filters.subcategory_ids.is_empty()
                    || p.subcategory_id.is_some_and(|c| filters.subcategory_ids.contains(&c))
            })
            .cloned()
            .collect();
        products.sort_by_key(|p| p.primary_key);
        products
    }

    fn relational_only(&self, operation: &'static str) -> Result<(), BackendError> {
        if self.kind == StoreKind::Relational {
            Ok(())
        } else {
            Err(self.unsupported(operation))
        }
    }
}

fn window_slice<T>(items: Vec<T>, window: Window) -> Vec<T> {
    items
        .into_iter()
        .skip(window.offset as usize)
        .take(window.limit as usize)
        .collect()
}

#[async_trait]
impl BackendAdapter for InMemoryBackend {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn parameter_ceiling(&self) -> usize {
        self.ceiling
    }

    async fn locate_by_code(&self, code: &str) -> Result<Vec<Match>, BackendError> {
        let mut state = lock(&self.state);
        state.locate_calls += 1;
        if let Some(error) = state.locate_error.clone() {
            return Err(error);
        }

        if self.kind == StoreKind::CommerceApi {
            return Ok(state
                .variants
                .iter()
                .filter(|v| v.barcode == code)
                .map(|v| self.variant_match(v))
                .collect());
        }

        let mut matches: Vec<Match> = state
            .reference
            .iter()
            .filter(|p| p.code == code)
            .map(|p| self.row_match(REFERENCE_COLLECTION, p.primary_key, &p.code, p.description.as_deref()))
            .collect();
        for (definition, rows) in &state.collections {
            matches.extend(
                rows.iter()
                    .filter(|r| r.code == code)
                    .map(|r| self.row_match(&definition.name, r.primary_key, &r.code, r.description.as_deref())),
            );
        }
        Ok(matches)
    }

    async fn replace_code(
        &self,
        old_code: &str,
        new_code: &str,
        matches: &[Match],
    ) -> Result<UpdateOutcome, BackendError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.replace_error.clone() {
            return Err(error);
        }

        let mut updated = 0u64;
        for m in matches.iter().filter(|m| m.store_id == self.store_id) {
            match &m.location {
                MatchLocation::Variant { variant_id, .. } => {
                    if let Some(variant) = state
                        .variants
                        .iter_mut()
                        .find(|v| &v.variant_id == variant_id && v.barcode == old_code)
                    {
                        variant.barcode = new_code.to_string();
                        updated += 1;
                    }
                }
                MatchLocation::Row {
                    collection,
                    primary_key,
                    ..
                } if collection == REFERENCE_COLLECTION => {
                    if let Some(product) = state
                        .reference
                        .iter_mut()
                        .find(|p| p.primary_key == *primary_key && p.code == old_code)
                    {
                        product.code = new_code.to_string();
                        updated += 1;
                    }
                }
                MatchLocation::Row {
                    collection,
                    primary_key,
                    ..
                } => {
                    if let Some(row) = state
                        .collections
                        .iter_mut()
                        .filter(|(c, _)| &c.name == collection)
                        .flat_map(|(_, rows)| rows.iter_mut())
                        .find(|r| r.primary_key == *primary_key && r.code == old_code)
                    {
                        row.code = new_code.to_string();
                        updated += 1;
                    }
                }
            }
        }
        if let Some(token) = state.cancel_on_replace.take() {
            token.cancel();
        }
        Ok(UpdateOutcome::from_parts(self.store_id, &self.store_name, updated, &[]))
    }

    async fn list_scannable_collections(&self) -> Result<Vec<ScannableCollection>, BackendError> {
        self.relational_only("list_scannable_collections")?;
        Ok(lock(&self.state)
            .collections
            .iter()
            .map(|(c, _)| c.clone())
            .collect())
    }

    async fn count_rows(&self, collection: &ScannableCollection, range: &DateRange) -> Result<u64, BackendError> {
        self.relational_only("count_rows")?;
        let state = lock(&self.state);
        if let Some((name, token)) = &state.cancel_on_count {
            if *name == collection.name {
                token.cancel();
            }
        }
        Ok(Self::scannable_rows(&state, &collection.name, range)?.len() as u64)
    }

    async fn scan_orphans_window(
        &self,
        collection: &ScannableCollection,
        window: Window,
        range: &DateRange,
    ) -> Result<Vec<OrphanRecord>, BackendError> {
        self.relational_only("scan_orphans_window")?;
        let gate = lock(&self.state).scan_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = lock(&self.state);
        if let Some((name, index, error)) = &state.scan_error {
            if *name == collection.name && *index == window.index {
                return Err(error.clone());
            }
        }

        let known: HashSet<&str> = state.reference.iter().map(|p| p.code.as_str()).collect();
        let rows = window_slice(Self::scannable_rows(&state, &collection.name, range)?, window);
        Ok(rows
            .into_iter()
            .filter(|r| !known.contains(r.code.as_str()))
            .map(|r| OrphanRecord {
                store_id: self.store_id,
                collection: collection.name.clone(),
                primary_key: r.primary_key,
                code: r.code,
                secondary_key: r.secondary_key,
                description: r.description,
            })
            .collect())
    }

    async fn existence_batch_check(&self, codes: &[String]) -> Result<HashSet<String>, BackendError> {
        if codes.len() > self.ceiling {
            return Err(BackendError::ProtocolLimit {
                requested: codes.len(),
                ceiling: self.ceiling,
            });
        }
        let mut state = lock(&self.state);
        state.existence_batches.push(codes.len());
        if let Some(error) = state.existence_error.clone() {
            return Err(error);
        }

        let present: HashSet<&str> = match self.kind {
            StoreKind::Relational => state.reference.iter().map(|p| p.code.as_str()).collect(),
            StoreKind::CommerceApi => state.variants.iter().map(|v| v.barcode.as_str()).collect(),
        };
        Ok(codes
            .iter()
            .filter(|c| present.contains(c.as_str()))
            .cloned()
            .collect())
    }

    async fn secondary_match_lookup(
        &self,
        strategy: MatchStrategy,
        record: &OrphanRecord,
    ) -> Result<Option<String>, BackendError> {
        self.relational_only("secondary_match_lookup")?;
        let Some(value) = strategy.lookup_value(record) else {
            return Ok(None);
        };
        let state = lock(&self.state);
        let mut candidates: Vec<&ReferenceProduct> = state
            .reference
            .iter()
            .filter(|p| !p.code.trim().is_empty())
            .filter(|p| match strategy {
                MatchStrategy::SecondaryKey => p.primary_key.to_string() == value,
                MatchStrategy::Description => p.description.as_deref() == Some(value),
            })
            .collect();
        candidates.sort_by_key(|p| p.primary_key);
        Ok(candidates.first().map(|p| p.code.clone()))
    }

    async fn count_products(&self, filters: &ComparisonFilters) -> Result<u64, BackendError> {
        self.relational_only("count_products")?;
        Ok(Self::filtered_products(&lock(&self.state), filters).len() as u64)
    }

    async fn products_window(
        &self,
        filters: &ComparisonFilters,
        window: Window,
    ) -> Result<Vec<ReferenceProduct>, BackendError> {
        self.relational_only("products_window")?;
        Ok(window_slice(Self::filtered_products(&lock(&self.state), filters), window))
    }

    async fn replace_rows(&self, rows: &[RowReplacement]) -> Result<Vec<RowUpdateResult>, BackendError> {
        self.relational_only("replace_rows")?;
        let mut state = lock(&self.state);
        if let Some(error) = state.replace_error.clone() {
            return Err(error);
        }

        let mut results = Vec::with_capacity(rows.len());
        for replacement in rows {
            let row = state
                .collections
                .iter_mut()
                .filter(|(c, _)| c.name == replacement.collection)
                .flat_map(|(_, rows)| rows.iter_mut())
                .find(|r| r.primary_key == replacement.primary_key && r.code == replacement.orphaned_code);
            let error = match row {
                Some(row) => {
                    row.code = replacement.replacement_code.clone();
                    None
                }
                None => Some("row not found or code already changed".to_string()),
            };
            results.push(RowUpdateResult {
                collection: replacement.collection.clone(),
                primary_key: replacement.primary_key,
                success: error.is_none(),
                error,
            });
        }
        Ok(results)
    }
}

/// Hands out pre-built backends by store id
#[derive(Default)]
pub struct InMemoryAdapterFactory {
    backends: HashMap<StoreId, Arc<InMemoryBackend>>,
}

impl InMemoryAdapterFactory {
    pub fn new(backends: impl IntoIterator<Item = Arc<InMemoryBackend>>) -> Self {
        Self {
            backends: backends.into_iter().map(|b| (b.store_id, b)).collect(),
        }
    }
}

impl AdapterFactory for InMemoryAdapterFactory {
    fn adapter_for(&self, store: &Store) -> Result<Arc<dyn BackendAdapter>, BackendError> {
        self.backends
            .get(&store.id)
            .map(|b| Arc::clone(b) as Arc<dyn BackendAdapter>)
            .ok_or_else(|| BackendError::Connectivity(format!("no backend for store {}", store.id)))
    }
}

#[derive(Default)]
pub struct InMemoryHistory {
    batches: Mutex<Vec<UpdateBatch>>,
    unavailable: bool,
}

impl InMemoryHistory {
    /// History whose every write fails.
    pub fn unavailable() -> Self {
        Self {
            batches: Mutex::default(),
            unavailable: true,
        }
    }

    pub fn batches(&self) -> Vec<UpdateBatch> {
        lock(&self.batches).clone()
    }
}

#[async_trait]
impl HistoryRecorder for InMemoryHistory {
    async fn record(&self, batch: &UpdateBatch) -> Result<()> {
        if self.unavailable {
            return Err(anyhow!("history store unavailable"));
        }
        lock(&self.batches).push(batch.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExclusions {
    codes: Mutex<HashMap<StoreId, HashSet<String>>>,
}

impl InMemoryExclusions {
    pub fn exclude(&self, store_id: StoreId, code: &str) {
        lock(&self.codes)
            .entry(store_id)
            .or_default()
            .insert(code.to_string());
    }
}

#[async_trait]
impl ExclusionStore for InMemoryExclusions {
    async fn excluded_codes(&self, store_id: StoreId) -> Result<HashSet<String>> {
        Ok(lock(&self.codes).get(&store_id).cloned().unwrap_or_default())
    }
}

/// Engine wired to in-memory collaborators
pub struct TestContext {
    pub engine: ReconciliationEngine,
    pub registry: Arc<StaticStoreRegistry>,
    pub history: Arc<InMemoryHistory>,
    pub exclusions: Arc<InMemoryExclusions>,
}

impl TestContext {
    pub fn new(stores: Vec<Store>, backends: Vec<Arc<InMemoryBackend>>) -> Self {
        Self::with_settings(stores, backends, EngineSettings::default(), InMemoryHistory::default())
    }

    pub fn with_settings(
        stores: Vec<Store>,
        backends: Vec<Arc<InMemoryBackend>>,
        settings: EngineSettings,
        history: InMemoryHistory,
    ) -> Self {
        let registry = Arc::new(StaticStoreRegistry::new(stores));
        let history = Arc::new(history);
        let exclusions = Arc::new(InMemoryExclusions::default());
        let engine = ReconciliationEngine::new(
            registry.clone(),
            Arc::new(InMemoryAdapterFactory::new(backends)),
            history.clone(),
            exclusions.clone(),
            settings,
        );
        Self {
            engine,
            registry,
            history,
            exclusions,
        }
    }
}

/// Drains a progress channel until it closes.
pub async fn collect_events(mut receiver: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    events
}
