//! Config-backed store registry
//!
//! The list is fixed at startup. Readers get cloned snapshots, so an
//! operation keeps the stores it started with.

use crate::application::StoreRegistry;
use crate::domain::{Store, StoreKind};

#[derive(Default)]
pub struct StaticStoreRegistry {
    stores: Vec<Store>,
}

impl StaticStoreRegistry {
    pub fn new(stores: Vec<Store>) -> Self {
        Self { stores }
    }
}

impl StoreRegistry for StaticStoreRegistry {
    fn list_active_stores(&self, kind: Option<StoreKind>) -> Vec<Store> {
        self.stores
            .iter()
            .filter(|store| store.active)
            .filter(|store| kind.is_none_or(|k| store.kind() == k))
            .cloned()
            .collect()
    }
}
