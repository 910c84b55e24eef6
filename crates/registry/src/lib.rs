//! Keel registry: generic, typed CRUD/list/watch for one resource kind over a
//! `KvStore`, parameterized by key derivation.
//!
//! Values are stored as JSON without `metadata.resourceVersion`; on read the
//! registry stamps the store's modification revision into it, which makes the
//! version usable as an update precondition and a watch cursor.

#![forbid(unsafe_code)]

mod keys;
mod predicate;

pub use keys::{
    check_name, cluster_key, cluster_key_fn, cluster_key_root_fn, namespace_key, namespace_key_fn, namespace_key_root,
    namespace_key_root_fn, KeyFn, KeyRootFn,
};
pub use predicate::{AttrFn, SelectionPredicate};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use keel_core::config::Tunables;
use keel_core::{ApiError, ApiResult, Context, DeleteOptions, ObjectList, Resource, Status, Watch, WatchEvent};
use keel_store::{KvStore, Revision, StoreError, StoreEvent, StoreEventKind};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Registry<T: Resource> {
    store: Arc<dyn KvStore>,
    key_root: KeyRootFn,
    key: KeyFn,
    queue_cap: usize,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> Registry<T> {
    pub fn new(store: Arc<dyn KvStore>, key_root: KeyRootFn, key: KeyFn) -> Self {
        Self { store, key_root, key, queue_cap: Tunables::from_env().queue_cap, _kind: PhantomData }
    }

    /// Keys `{prefix}/{name}`.
    pub fn cluster_scoped(store: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self::new(store, cluster_key_root_fn(prefix), cluster_key_fn(prefix))
    }

    /// Keys `{prefix}/{namespace}/{name}`.
    pub fn namespaced(store: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self::new(store, namespace_key_root_fn(prefix), namespace_key_fn(prefix))
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn key_for(&self, ctx: &Context, name: &str) -> ApiResult<String> {
        (self.key)(ctx, name)
    }

    /// List/watch prefix, always slash-terminated so `/x/foo` never matches `/x/foobar/...`.
    pub fn prefix_for(&self, ctx: &Context) -> String {
        let mut root = (self.key_root)(ctx);
        if !root.ends_with('/') {
            root.push('/');
        }
        root
    }

    pub async fn create_with_name(&self, ctx: &Context, name: &str, obj: &T) -> ApiResult<T> {
        let started = Instant::now();
        let key = self.key_for(ctx, name)?;
        let data = encode(obj)?;
        let kv = ctx.run(async { self.store.create(&key, data).await.map_err(|e| store_err::<T>(name, e)) }).await?;
        debug!(kind = T::KIND, key = %key, rev = kv.mod_revision, "registry: created");
        observe::<T>("create", started);
        decode(&kv.value, kv.mod_revision)
    }

    pub async fn get(&self, ctx: &Context, name: &str) -> ApiResult<T> {
        let started = Instant::now();
        let key = self.key_for(ctx, name)?;
        let kv = ctx.run(async { self.store.get(&key).await.map_err(|e| store_err::<T>(name, e)) }).await?;
        let kv = kv.ok_or_else(|| ApiError::not_found(T::KIND, name))?;
        observe::<T>("get", started);
        decode(&kv.value, kv.mod_revision)
    }

    /// Overwrite an existing object. A non-empty `obj.metadata.resourceVersion` makes the
    /// write conditional on it (`VersionMismatch` when the stored object has moved on).
    pub async fn update_with_name(&self, ctx: &Context, name: &str, obj: &T) -> ApiResult<T> {
        let started = Instant::now();
        let key = self.key_for(ctx, name)?;
        let expected = parse_resource_version(&obj.meta().resource_version)?;
        let data = encode(obj)?;
        let kv = ctx.run(async { self.store.update(&key, data, expected).await.map_err(|e| store_err::<T>(name, e)) }).await?;
        debug!(kind = T::KIND, key = %key, rev = kv.mod_revision, conditional = expected.is_some(), "registry: updated");
        observe::<T>("update", started);
        decode(&kv.value, kv.mod_revision)
    }

    /// Remove an object and return its last stored state.
    pub async fn delete(&self, ctx: &Context, name: &str, opts: &DeleteOptions) -> ApiResult<T> {
        let started = Instant::now();
        let key = self.key_for(ctx, name)?;
        let expected = match &opts.resource_version {
            Some(rv) => parse_resource_version(rv)?,
            None => None,
        };
        let kv = ctx.run(async { self.store.delete(&key, expected).await.map_err(|e| store_err::<T>(name, e)) }).await?;
        debug!(kind = T::KIND, key = %key, "registry: deleted");
        observe::<T>("delete", started);
        decode(&kv.value, kv.mod_revision)
    }

    /// Snapshot of every object in scope that matches `pred`, in key order.
    pub async fn list_predicate(&self, ctx: &Context, pred: &SelectionPredicate<T>) -> ApiResult<ObjectList<T>> {
        let started = Instant::now();
        let prefix = self.prefix_for(ctx);
        let (kvs, rev) = ctx.run(async { self.store.list(&prefix).await.map_err(|e| store_err::<T>("", e)) }).await?;
        let total = kvs.len();
        let mut items = Vec::with_capacity(total);
        for kv in kvs {
            let obj: T = decode(&kv.value, kv.mod_revision)?;
            if pred.matches(&obj) {
                items.push(obj);
            }
        }
        debug!(kind = T::KIND, prefix = %prefix, total, matched = items.len(), rev, "registry: listed");
        observe::<T>("list", started);
        Ok(ObjectList::new(items, rev))
    }

    /// Stream changes in scope as seen through `pred`, starting after `resource_version`
    /// (empty or `"0"` starts now). An object leaving the predicate's view on update
    /// is reported as `DELETED`. Cancelling `ctx` or dropping the watch ends it.
    pub async fn watch_predicate(
        &self,
        ctx: &Context,
        pred: SelectionPredicate<T>,
        resource_version: &str,
    ) -> ApiResult<Watch<WatchEvent<T>>> {
        let from = parse_resource_version(resource_version)?.unwrap_or(0);
        let prefix = self.prefix_for(ctx);
        let mut inner = ctx.run(async { self.store.watch(&prefix, from).await.map_err(|e| store_err::<T>("", e)) }).await?;
        counter!("registry_ops_total", 1u64, "kind" => T::KIND, "op" => "watch");
        let cancel = ctx.cancel_token().clone();
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let task = tokio::spawn(async move {
            debug!(kind = T::KIND, prefix = %prefix, from, "registry: watch started");
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = inner.recv() => item,
                };
                let Some(item) = item else { break };
                let out = match item {
                    Ok(ev) => match translate(&pred, ev) {
                        Ok(Some(out)) => out,
                        Ok(None) => continue,
                        Err(e) => WatchEvent::Error(Status::from(e)),
                    },
                    Err(e) => {
                        warn!(kind = T::KIND, error = %e, "registry: store watch failed");
                        WatchEvent::Error(Status::from(store_err::<T>("", e)))
                    }
                };
                let terminal = matches!(out, WatchEvent::Error(_));
                counter!("watch_events_total", 1u64, "kind" => T::KIND, "type" => out.type_str());
                if tx.send(out).await.is_err() || terminal {
                    break;
                }
            }
            // `inner` drops here, releasing the store subscription.
            debug!(kind = T::KIND, prefix = %prefix, "registry: watch ended");
        });
        Ok(Watch::new(rx, task))
    }
}

fn observe<T: Resource>(op: &'static str, started: Instant) {
    counter!("registry_ops_total", 1u64, "kind" => T::KIND, "op" => op);
    histogram!("registry_op_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => T::KIND, "op" => op);
}

/// `""` means unset; anything else must be a store revision.
pub fn parse_resource_version(rv: &str) -> ApiResult<Option<Revision>> {
    if rv.is_empty() {
        return Ok(None);
    }
    rv.parse::<Revision>()
        .map(|r| if r == 0 { None } else { Some(r) })
        .map_err(|_| ApiError::BadRequest(format!("invalid resourceVersion {:?}", rv)))
}

fn encode<T: Resource>(obj: &T) -> ApiResult<Vec<u8>> {
    let mut o = obj.clone();
    o.fill_type_meta();
    o.meta_mut().resource_version.clear();
    serde_json::to_vec(&o).map_err(|e| ApiError::Internal(format!("encoding {}: {}", T::KIND, e)))
}

fn decode<T: Resource>(data: &[u8], rev: Revision) -> ApiResult<T> {
    let mut o: T = serde_json::from_slice(data).map_err(|e| ApiError::Internal(format!("decoding stored {}: {}", T::KIND, e)))?;
    o.fill_type_meta();
    o.meta_mut().resource_version = rev.to_string();
    Ok(o)
}

fn store_err<T: Resource>(name: &str, e: StoreError) -> ApiError {
    match e {
        StoreError::KeyNotFound(_) => ApiError::not_found(T::KIND, name),
        StoreError::KeyExists(_) => ApiError::already_exists(T::KIND, name),
        StoreError::RevisionMismatch { expected, actual, .. } => ApiError::VersionMismatch {
            kind: T::KIND.to_string(),
            name: name.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        },
        StoreError::Compacted { requested, oldest } => {
            ApiError::Gone(format!("too old resource version: {} (oldest available {})", requested, oldest))
        }
        StoreError::Lagged(n) => ApiError::Gone(format!("watch fell behind by {} events; re-list and watch again", n)),
        StoreError::Backend(msg) => ApiError::Internal(msg),
    }
}

/// Map one store event through `pred`. Objects carry the event's revision.
fn translate<T: Resource>(pred: &SelectionPredicate<T>, ev: StoreEvent) -> ApiResult<Option<WatchEvent<T>>> {
    let cur: Option<T> = ev.value.as_deref().map(|v| decode(v, ev.revision)).transpose()?;
    let prev: Option<T> = ev.prev_value.as_deref().map(|v| decode(v, ev.revision)).transpose()?;
    let cur_ok = cur.as_ref().map(|o| pred.matches(o)).unwrap_or(false);
    let prev_ok = prev.as_ref().map(|o| pred.matches(o)).unwrap_or(false);
    Ok(match (ev.kind, cur, prev) {
        (StoreEventKind::Put, Some(c), None) => cur_ok.then(|| WatchEvent::Added(c)),
        (StoreEventKind::Put, Some(c), Some(p)) => match (cur_ok, prev_ok) {
            (true, true) => Some(WatchEvent::Modified(c)),
            (true, false) => Some(WatchEvent::Added(c)),
            (false, true) => Some(WatchEvent::Deleted(p)),
            (false, false) => None,
        },
        (StoreEventKind::Delete, _, Some(p)) => prev_ok.then(|| WatchEvent::Deleted(p)),
        _ => None,
    })
}
