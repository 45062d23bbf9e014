//! A weak-reference document cache: every lookup still round-trips to the
//! adapter, but a hit whose revision hasn't changed reuses the previously
//! allocated `Document` instead of cloning a fresh one out of the adapter's
//! response.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{Document, GetOptions};
use rouchdb_core::error::Result;

pub struct DocCache {
    entries: Mutex<HashMap<String, Weak<Document>>>,
}

impl DocCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Fetch `id`'s current winning revision, reusing the cached `Arc` if
    /// the adapter reports the same revision back.
    pub async fn get(&self, adapter: &dyn Adapter, id: &str) -> Result<Arc<Document>> {
        let fresh = adapter.get(id, GetOptions::default()).await?;

        if let Some(cached) = self.entries.lock().unwrap().get(id).and_then(Weak::upgrade) {
            if cached.rev == fresh.rev {
                return Ok(cached);
            }
        }

        let doc = Arc::new(fresh);
        self.entries.lock().unwrap().insert(id.to_string(), Arc::downgrade(&doc));
        Ok(doc)
    }

    /// Drop every cached entry. The next `get` for any id repopulates it.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for DocCache {
    fn default() -> Self {
        Self::new()
    }
}
