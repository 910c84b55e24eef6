//! REST handlers: semantic checks and field merge rules on top of a `Registry`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use keel_core::{
    ApiError, ApiResult, Configuration, ConfigurationList, Context, DeleteOptions, ObjectList, Resource, Selector, Set,
    Watch, WatchEvent,
};
use keel_registry::{AttrFn, Registry, SelectionPredicate};
use keel_store::KvStore;
use tracing::info;

use crate::validation::validate_configuration;

/// Store prefix for Configuration objects.
pub const CONFIGURATION_PREFIX: &str = "/registry/configurations";

/// REST storage for one kind. The HTTP surface is generic over this trait.
#[async_trait]
pub trait ResourceRest: Send + Sync + 'static {
    type Object: Resource;

    async fn create(&self, ctx: &Context, obj: Self::Object) -> ApiResult<Self::Object>;

    /// Apply the editable fields of `obj` to the stored object of the same name.
    async fn update(&self, ctx: &Context, obj: Self::Object) -> ApiResult<Self::Object>;

    async fn delete(&self, ctx: &Context, name: &str, opts: &DeleteOptions) -> ApiResult<Self::Object>;

    async fn get(&self, ctx: &Context, name: &str) -> ApiResult<Self::Object>;

    async fn list(&self, ctx: &Context, label: Selector, field: Selector) -> ApiResult<ObjectList<Self::Object>>;

    async fn watch(
        &self,
        ctx: &Context,
        label: Selector,
        field: Selector,
        resource_version: &str,
    ) -> ApiResult<Watch<WatchEvent<Self::Object>>>;
}

/// Rejects a body that names a different kind. An empty kind is accepted.
pub fn check_kind<T: Resource>(obj: &T) -> ApiResult<()> {
    let kind = &obj.type_meta().kind;
    if kind.is_empty() || kind == T::KIND {
        Ok(())
    } else {
        Err(ApiError::InvalidObjectType { expected: T::KIND.to_string(), got: kind.clone() })
    }
}

/// Cluster-scoped registry under [`CONFIGURATION_PREFIX`].
pub fn new_registry(store: Arc<dyn KvStore>) -> Registry<Configuration> {
    Registry::cluster_scoped(store, CONFIGURATION_PREFIX)
}

/// Queryable projection: labels as-is, fields `{type}`.
pub fn get_attrs(cfg: &Configuration) -> (Set, Set) {
    (cfg.metadata.labels.clone(), Set::from([("type".to_string(), cfg.type_.clone())]))
}

pub struct ConfigurationRest {
    registry: Registry<Configuration>,
    attrs: AttrFn<Configuration>,
}

impl ConfigurationRest {
    pub fn new(registry: Registry<Configuration>) -> Self {
        Self { registry, attrs: Arc::new(get_attrs) }
    }

    pub fn from_store(store: Arc<dyn KvStore>) -> Self {
        Self::new(new_registry(store))
    }

    pub fn registry(&self) -> &Registry<Configuration> {
        &self.registry
    }

    fn predicate(&self, label: Selector, field: Selector) -> SelectionPredicate<Configuration> {
        SelectionPredicate::new(label, field, Arc::clone(&self.attrs))
    }

    fn check_placement(cfg: &Configuration) -> ApiResult<()> {
        check_kind(cfg)?;
        if !cfg.metadata.namespace.is_empty() {
            return Err(ApiError::conflict(
                Configuration::KIND,
                &cfg.metadata.namespace,
                "Configuration objects should not have a namespace.",
            ));
        }
        if cfg.metadata.name.is_empty() {
            return Err(ApiError::conflict(Configuration::KIND, "", "Configuration objects must have a name."));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceRest for ConfigurationRest {
    type Object = Configuration;

    async fn create(&self, ctx: &Context, mut cfg: Configuration) -> ApiResult<Configuration> {
        let t0 = Instant::now();
        info!(name = %cfg.metadata.name, "api: create start");
        Self::check_placement(&cfg)?;
        let errs = validate_configuration(&cfg);
        if !errs.is_empty() {
            info!(name = %cfg.metadata.name, violations = errs.len(), "api: create invalid");
            return Err(ApiError::invalid(Configuration::KIND, &cfg.metadata.name, errs));
        }
        cfg.metadata.uid = uuid::Uuid::new_v4().to_string();
        cfg.metadata.creation_timestamp = Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        cfg.metadata.resource_version.clear();
        let name = cfg.metadata.name.clone();
        self.registry.create_with_name(ctx, &name, &cfg).await?;
        let out = self.registry.get(ctx, &name).await?;
        info!(name = %name, rv = %out.metadata.resource_version, took_ms = %t0.elapsed().as_millis(), "api: create ok");
        Ok(out)
    }

    async fn update(&self, ctx: &Context, cfg: Configuration) -> ApiResult<Configuration> {
        let t0 = Instant::now();
        info!(name = %cfg.metadata.name, rv = %cfg.metadata.resource_version, "api: update start");
        Self::check_placement(&cfg)?;
        let mut edit = self.registry.get(ctx, &cfg.metadata.name).await?;
        // Only these fields are editable; `type` and system metadata stay as stored.
        // Without a caller version the write is still conditional on the one just read.
        edit.metadata.labels = cfg.metadata.labels;
        if !cfg.metadata.resource_version.is_empty() {
            edit.metadata.resource_version = cfg.metadata.resource_version;
        }
        edit.metadata.annotations = cfg.metadata.annotations;
        edit.flags = cfg.flags;
        let errs = validate_configuration(&edit);
        if !errs.is_empty() {
            return Err(ApiError::invalid(Configuration::KIND, &edit.metadata.name, errs));
        }
        let name = edit.metadata.name.clone();
        let out = self.registry.update_with_name(ctx, &name, &edit).await?;
        info!(name = %name, rv = %out.metadata.resource_version, took_ms = %t0.elapsed().as_millis(), "api: update ok");
        Ok(out)
    }

    async fn delete(&self, ctx: &Context, name: &str, opts: &DeleteOptions) -> ApiResult<Configuration> {
        let t0 = Instant::now();
        info!(name = %name, "api: delete start");
        self.registry.get(ctx, name).await?;
        let out = self.registry.delete(ctx, name, opts).await?;
        info!(name = %name, took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(out)
    }

    async fn get(&self, ctx: &Context, name: &str) -> ApiResult<Configuration> {
        self.registry.get(ctx, name).await
    }

    async fn list(&self, ctx: &Context, label: Selector, field: Selector) -> ApiResult<ConfigurationList> {
        let t0 = Instant::now();
        let out = self.registry.list_predicate(ctx, &self.predicate(label, field)).await?;
        info!(items = out.items.len(), rv = %out.metadata.resource_version, took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(out)
    }

    async fn watch(
        &self,
        ctx: &Context,
        label: Selector,
        field: Selector,
        resource_version: &str,
    ) -> ApiResult<Watch<WatchEvent<Configuration>>> {
        info!(label = %label, field = %field, rv = %resource_version, "api: watch start");
        self.registry.watch_predicate(ctx, self.predicate(label, field), resource_version).await
    }
}
