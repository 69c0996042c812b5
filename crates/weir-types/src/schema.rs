//! Fingerprint-keyed schema interning.
//!
//! Every schema observed during a pipeline run is interned exactly once;
//! batches hold `Arc<Type>` handles that stay alive for the duration of the
//! run. The lock is short-held and never spans an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::{Fingerprint, Type};

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    inner: Mutex<HashMap<Fingerprint, Arc<Type>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a schema, returning the shared handle. Structurally equal
    /// schemas share one handle.
    pub fn intern(&self, ty: Type) -> Arc<Type> {
        let fingerprint = ty.fingerprint();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(fingerprint).or_insert_with(|| Arc::new(ty)).clone()
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Type>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
