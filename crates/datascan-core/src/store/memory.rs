//! In-process object pools, shared between workers through `Arc`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Cluster, CreateOutcome, ObjectPool};
use crate::error::StoreError;

#[derive(Debug, Default, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    omap_header: Vec<u8>,
    omap: BTreeMap<String, Vec<u8>>,
}

/// One pool held in memory
#[derive(Debug)]
pub struct MemoryPool {
    pool_id: i64,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
}

impl MemoryPool {
    pub fn new(pool_id: i64) -> Self {
        Self {
            pool_id,
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemoryObject>>, StoreError> {
        self.objects
            .lock()
            .map_err(|_| StoreError::Backend(format!("pool {} lock poisoned", self.pool_id)))
    }
}

impl ObjectPool for MemoryPool {
    fn pool_id(&self) -> i64 {
        self.pool_id
    }

    fn exists(&self, oid: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(oid))
    }

    fn create(
        &self,
        oid: &str,
        data: &[u8],
        omap_header: &[u8],
    ) -> Result<CreateOutcome, StoreError> {
        let mut objects = self.lock()?;
        if objects.contains_key(oid) {
            return Ok(CreateOutcome::Exists);
        }
        objects.insert(
            oid.to_string(),
            MemoryObject {
                data: data.to_vec(),
                omap_header: omap_header.to_vec(),
                omap: BTreeMap::new(),
            },
        );
        Ok(CreateOutcome::Created)
    }

    fn read(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(oid).map(|o| o.data.clone()))
    }

    fn omap_get_header(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(oid).map(|o| o.omap_header.clone()))
    }

    fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .lock()?
            .get(oid)
            .and_then(|o| o.omap.get(key).cloned()))
    }

    fn omap_set(&self, oid: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.lock()?;
        let object = objects
            .get_mut(oid)
            .ok_or_else(|| StoreError::NoSuchObject(oid.to_string()))?;
        object.omap.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn omap_keys(&self, oid: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .get(oid)
            .map(|o| o.omap.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn list_objects(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// A set of in-memory pools standing in for a cluster session
#[derive(Debug, Default)]
pub struct MemoryCluster {
    pools: Mutex<HashMap<i64, Arc<MemoryPool>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pools(pool_ids: &[i64]) -> Self {
        let cluster = Self::new();
        for id in pool_ids {
            cluster.create_pool(*id);
        }
        cluster
    }

    /// Create a pool if it does not exist yet and return it
    pub fn create_pool(&self, pool_id: i64) -> Arc<MemoryPool> {
        let mut pools = match self.pools.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pools
            .entry(pool_id)
            .or_insert_with(|| Arc::new(MemoryPool::new(pool_id)))
            .clone()
    }

    /// Direct handle on a pool, for inspection in tests and tools
    pub fn pool(&self, pool_id: i64) -> Option<Arc<MemoryPool>> {
        self.pools.lock().ok()?.get(&pool_id).cloned()
    }
}

impl Cluster for MemoryCluster {
    fn open_pool(&self, pool_id: i64) -> Result<Arc<dyn ObjectPool>, StoreError> {
        let pools = self
            .pools
            .lock()
            .map_err(|_| StoreError::Backend("cluster lock poisoned".to_string()))?;
        pools
            .get(&pool_id)
            .cloned()
            .map(|p| p as Arc<dyn ObjectPool>)
            .ok_or(StoreError::NoSuchPool(pool_id))
    }
}
