//! Builds and caches backend adapters per store
//!
//! Adapters own a connection pool or HTTP client, so one is kept per store
//! and rebuilt only when the store's connection parameters change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::application::{AdapterFactory, BackendAdapter};
use crate::domain::{BackendError, Store, StoreConnection, StoreId};
use crate::infrastructure::commerce::CommerceAdapter;
use crate::infrastructure::config::{CommerceConfig, RelationalConfig};
use crate::infrastructure::relational::RelationalAdapter;

type CachedAdapter = (StoreConnection, Arc<dyn BackendAdapter>);

pub struct DefaultAdapterFactory {
    relational: RelationalConfig,
    commerce: CommerceConfig,
    parameter_ceiling: usize,
    cache: Mutex<HashMap<StoreId, CachedAdapter>>,
}

impl DefaultAdapterFactory {
    pub fn new(relational: RelationalConfig, commerce: CommerceConfig, parameter_ceiling: usize) -> Self {
        Self {
            relational,
            commerce,
            parameter_ceiling,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, store: &Store) -> Result<Arc<dyn BackendAdapter>, BackendError> {
        Ok(match &store.connection {
            StoreConnection::Relational(connection) => Arc::new(RelationalAdapter::new(
                store,
                connection,
                &self.relational,
                self.parameter_ceiling,
            )?),
            StoreConnection::CommerceApi(connection) => {
                Arc::new(CommerceAdapter::new(store, connection, &self.commerce)?)
            }
        })
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn adapter_for(&self, store: &Store) -> Result<Arc<dyn BackendAdapter>, BackendError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| BackendError::InvalidConfig("adapter cache poisoned".to_string()))?;

        if let Some((connection, adapter)) = cache.get(&store.id) {
            if *connection == store.connection {
                return Ok(Arc::clone(adapter));
            }
            debug!("Connection for store {} changed, rebuilding adapter", store.id);
        }

        let adapter = self.build(store)?;
        cache.insert(store.id, (store.connection.clone(), Arc::clone(&adapter)));
        Ok(adapter)
    }
}
