//! Credential-keyed client pool.
//!
//! Explicit replacement for a process-wide per-credential singleton: the
//! composition root builds one pool and passes it by reference.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_core::{ApiKey, Result};
use tracing::info;

use crate::client::ParleyClient;

/// At most one [`ParleyClient`] per API key.
#[derive(Default)]
pub struct ClientPool {
    clients: DashMap<ApiKey, Arc<ParleyClient>>,
}

impl ClientPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `api_key`, built by `factory` on first use. A failed build
    /// leaves the pool unchanged.
    pub fn get_or_create<F>(&self, api_key: &ApiKey, factory: F) -> Result<Arc<ParleyClient>>
    where
        F: FnOnce() -> Result<ParleyClient>,
    {
        match self.clients.entry(api_key.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let client = Arc::new(factory()?);
                let _ = entry.insert(Arc::clone(&client));
                info!(api_key = %api_key, "client created");
                Ok(client)
            }
        }
    }

    /// Client for `api_key`, if one exists.
    pub fn get(&self, api_key: &ApiKey) -> Option<Arc<ParleyClient>> {
        self.clients.get(api_key).map(|c| Arc::clone(c.value()))
    }

    /// Forget the client for `api_key`. The client is not closed.
    pub fn remove(&self, api_key: &ApiKey) -> Option<Arc<ParleyClient>> {
        self.clients.remove(api_key).map(|(_, client)| client)
    }

    /// Number of pooled clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
