use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use keel_core::config::Tunables;
use metrics::counter;

use crate::{
    KeyValue, KvStore, Revision, StoreError, StoreEvent, StoreEventKind, StoreResult, StoreWatch, WatchHub,
};

struct MemState {
    data: BTreeMap<String, KeyValue>,
    revision: Revision,
    hub: WatchHub,
}

/// In-memory ordered store.
pub struct MemStore {
    state: Mutex<MemState>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::with_tunables(&Tunables::default())
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_tunables(&Tunables::from_env())
    }

    pub fn with_tunables(t: &Tunables) -> Self {
        Self { state: Mutex::new(MemState { data: BTreeMap::new(), revision: 0, hub: WatchHub::new(t) }) }
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemState>> {
        self.state.lock().map_err(|_| StoreError::Backend("mem store lock poisoned".into()))
    }
}

fn check_expected(key: &str, cur: &KeyValue, expected: Option<Revision>) -> StoreResult<()> {
    match expected {
        Some(exp) if exp != cur.mod_revision => {
            Err(StoreError::RevisionMismatch { key: key.to_string(), expected: exp, actual: cur.mod_revision })
        }
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        Ok(self.state()?.data.get(key).cloned())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<KeyValue> {
        let mut st = self.state()?;
        if st.data.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        st.revision += 1;
        let rev = st.revision;
        let kv = KeyValue { key: key.to_string(), value: value.clone(), create_revision: rev, mod_revision: rev };
        st.data.insert(key.to_string(), kv.clone());
        st.hub.publish(StoreEvent { kind: StoreEventKind::Put, key: key.to_string(), value: Some(value), prev_value: None, revision: rev });
        counter!("store_writes_total", 1u64, "op" => "create");
        Ok(kv)
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: Option<Revision>) -> StoreResult<KeyValue> {
        let mut st = self.state()?;
        let cur = st.data.get(key).cloned().ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        check_expected(key, &cur, expected)?;
        st.revision += 1;
        let rev = st.revision;
        let kv = KeyValue { key: key.to_string(), value: value.clone(), create_revision: cur.create_revision, mod_revision: rev };
        st.data.insert(key.to_string(), kv.clone());
        st.hub.publish(StoreEvent { kind: StoreEventKind::Put, key: key.to_string(), value: Some(value), prev_value: Some(cur.value), revision: rev });
        counter!("store_writes_total", 1u64, "op" => "update");
        Ok(kv)
    }

    async fn delete(&self, key: &str, expected: Option<Revision>) -> StoreResult<KeyValue> {
        let mut st = self.state()?;
        let cur = st.data.get(key).cloned().ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        check_expected(key, &cur, expected)?;
        st.data.remove(key);
        st.revision += 1;
        let rev = st.revision;
        st.hub.publish(StoreEvent { kind: StoreEventKind::Delete, key: key.to_string(), value: None, prev_value: Some(cur.value.clone()), revision: rev });
        counter!("store_writes_total", 1u64, "op" => "delete");
        Ok(cur)
    }

    async fn list(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)> {
        let st = self.state()?;
        let items = st
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        Ok((items, st.revision))
    }

    async fn watch(&self, prefix: &str, from: Revision) -> StoreResult<StoreWatch> {
        let sub = {
            let st = self.state()?;
            st.hub.subscribe(prefix, from, st.revision)?
        };
        Ok(sub.spawn())
    }

    async fn revision(&self) -> StoreResult<Revision> {
        Ok(self.state()?.revision)
    }

    fn watchers(&self) -> StoreResult<usize> {
        Ok(self.state()?.hub.watchers())
    }
}
