use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rouchdb::{Database, Result, RouchError};
use tokio::sync::RwLock;

/// Where a database's on-disk file (if any) lives. Matching the teacher's
/// memory-vs-redb split one level up: `None` means every database created
/// this run is ephemeral, gone when the process exits.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    data_dir: Option<PathBuf>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl AppState {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self { inner: Arc::new(Inner { data_dir, databases: RwLock::new(HashMap::new()) }) }
    }

    /// The database named `name`, if it has been created.
    pub async fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.inner.databases.read().await.get(name).cloned()
    }

    /// Create database `name`. Fails with `DatabaseExists` if it's already open.
    pub async fn create(&self, name: &str) -> Result<()> {
        let mut databases = self.inner.databases.write().await;
        if databases.contains_key(name) {
            return Err(RouchError::DatabaseExists(name.to_string()));
        }
        let db = match &self.inner.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(RouchError::Io)?;
                Database::open(dir.join(format!("{name}.redb")), name)?
            }
            None => Database::memory(name),
        };
        databases.insert(name.to_string(), Arc::new(db));
        Ok(())
    }

    /// Drop `name` from the registry and destroy its storage.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let db = {
            let mut databases = self.inner.databases.write().await;
            databases.remove(name).ok_or_else(|| RouchError::NotFound("missing".to_string()))?
        };
        db.destroy().await
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.databases.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
