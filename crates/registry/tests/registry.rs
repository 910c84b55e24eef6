#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    ApiError, Configuration, Context, DeleteOptions, ObjectMeta, Resource, Selector, Set, TypeMeta, WatchEvent,
};
use keel_registry::{AttrFn, Registry, SelectionPredicate};
use keel_store::{KvStore, MemStore};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

fn attrs() -> AttrFn<Configuration> {
    Arc::new(|c: &Configuration| (c.metadata.labels.clone(), Set::from([("type".to_string(), c.type_.clone())])))
}

fn registry() -> (Arc<MemStore>, Registry<Configuration>) {
    let store = Arc::new(MemStore::default());
    let reg = Registry::cluster_scoped(store.clone() as Arc<dyn KvStore>, "/registry/configurations");
    (store, reg)
}

fn label(sel: &str) -> SelectionPredicate<Configuration> {
    SelectionPredicate::new(Selector::parse(sel).unwrap(), Selector::everything(), attrs())
}

async fn next(w: &mut keel_core::Watch<WatchEvent<Configuration>>) -> WatchEvent<Configuration> {
    tokio::time::timeout(Duration::from_secs(5), w.recv()).await.expect("watch stalled").expect("watch closed")
}

#[tokio::test]
async fn create_get_stamps_version() {
    let (store, reg) = registry();
    let ctx = Context::new();
    let created = reg.create_with_name(&ctx, "db", &Configuration::new("db", "postgres")).await.unwrap();
    assert_eq!(created.metadata.resource_version, "1");
    assert_eq!(created.type_meta.kind, "Configuration");

    let got = reg.get(&ctx, "db").await.unwrap();
    assert_eq!(got, created);

    // Stored bytes never carry the version.
    let raw = store.get("/registry/configurations/db").await.unwrap().unwrap();
    let v: serde_json::Value = serde_json::from_slice(&raw.value).unwrap();
    assert!(v["metadata"].get("resourceVersion").is_none());
}

#[tokio::test]
async fn create_twice_is_already_exists() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let c = Configuration::new("db", "postgres");
    reg.create_with_name(&ctx, "db", &c).await.unwrap();
    let err = reg.create_with_name(&ctx, "db", &c.clone().with_flag("x", "1")).await.unwrap_err();
    assert!(matches!(err, ApiError::AlreadyExists { .. }), "{err:?}");
    assert!(reg.get(&ctx, "db").await.unwrap().flags.is_empty());
}

#[tokio::test]
async fn get_missing_is_not_found() {
    let (_, reg) = registry();
    let err = reg.get(&Context::new(), "nope").await.unwrap_err();
    assert_eq!(err, ApiError::not_found("Configuration", "nope"));
}

#[tokio::test]
async fn bad_names_are_rejected_before_the_store() {
    let (store, reg) = registry();
    let ctx = Context::new();
    for name in ["", "..", "a/b"] {
        let err = reg.create_with_name(&ctx, name, &Configuration::new(name, "t")).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)), "{name}: {err:?}");
    }
    assert_eq!(store.revision().await.unwrap(), 0);
}

#[tokio::test]
async fn update_with_stale_version_conflicts() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let v1 = reg.create_with_name(&ctx, "db", &Configuration::new("db", "postgres")).await.unwrap();

    let v2 = reg.update_with_name(&ctx, "db", &v1.clone().with_flag("a", "1")).await.unwrap();
    assert_eq!(v2.metadata.resource_version, "2");

    let err = reg.update_with_name(&ctx, "db", &v1.clone().with_flag("b", "2")).await.unwrap_err();
    match err {
        ApiError::VersionMismatch { expected, actual, .. } => {
            assert_eq!(expected, "1");
            assert_eq!(actual, "2");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err_code(&reg, &ctx, &v1).await, 409);

    // No version: unconditional overwrite.
    let mut blind = v1.with_flag("c", "3");
    blind.metadata.resource_version.clear();
    let v3 = reg.update_with_name(&ctx, "db", &blind).await.unwrap();
    assert_eq!(v3.metadata.resource_version, "3");
    assert_eq!(v3.flags.get("c").map(String::as_str), Some("3"));
}

async fn err_code(reg: &Registry<Configuration>, ctx: &Context, obj: &Configuration) -> u16 {
    reg.update_with_name(ctx, "db", obj).await.unwrap_err().code()
}

#[tokio::test]
async fn update_missing_is_not_found_and_bad_version_is_bad_request() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let err = reg.update_with_name(&ctx, "ghost", &Configuration::new("ghost", "t")).await.unwrap_err();
    assert!(err.is_not_found());

    let mut c = Configuration::new("db", "t");
    c.metadata.resource_version = "abc".into();
    let err = reg.update_with_name(&ctx, "db", &c).await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn delete_returns_last_state_and_honours_precondition() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let v1 = reg.create_with_name(&ctx, "db", &Configuration::new("db", "postgres")).await.unwrap();
    reg.update_with_name(&ctx, "db", &v1.with_flag("a", "1")).await.unwrap();

    let stale = DeleteOptions { resource_version: Some("1".into()) };
    assert!(matches!(reg.delete(&ctx, "db", &stale).await, Err(ApiError::VersionMismatch { .. })));

    let gone = reg.delete(&ctx, "db", &DeleteOptions::default()).await.unwrap();
    assert_eq!(gone.flags.get("a").map(String::as_str), Some("1"));
    assert!(reg.get(&ctx, "db").await.unwrap_err().is_not_found());
    assert!(reg.delete(&ctx, "db", &DeleteOptions::default()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_filters_by_label_and_field() {
    let (_, reg) = registry();
    let ctx = Context::new();
    reg.create_with_name(&ctx, "a", &Configuration::new("a", "postgres").with_label("env", "prod")).await.unwrap();
    reg.create_with_name(&ctx, "b", &Configuration::new("b", "redis").with_label("env", "prod")).await.unwrap();
    reg.create_with_name(&ctx, "c", &Configuration::new("c", "postgres").with_label("env", "dev")).await.unwrap();

    let all = reg.list_predicate(&ctx, &SelectionPredicate::everything(attrs())).await.unwrap();
    assert_eq!(all.type_meta.kind, "ConfigurationList");
    assert_eq!(all.metadata.resource_version, "3");
    let names: Vec<_> = all.items.iter().map(|c| c.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    let prod = reg.list_predicate(&ctx, &label("env=prod")).await.unwrap();
    assert_eq!(prod.items.len(), 2);

    let pred = SelectionPredicate::new(Selector::parse("env=prod").unwrap(), Selector::parse("type=postgres").unwrap(), attrs());
    let hits = reg.list_predicate(&ctx, &pred).await.unwrap();
    assert_eq!(hits.items.len(), 1);
    assert_eq!(hits.items[0].metadata.name, "a");
    assert_eq!(hits.items[0].metadata.resource_version, "1");
}

#[tokio::test]
async fn watch_reports_label_transitions() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let mut w = reg.watch_predicate(&ctx, label("env=prod"), "").await.unwrap();

    // Not matching: nothing emitted.
    let c = reg.create_with_name(&ctx, "a", &Configuration::new("a", "t").with_label("env", "dev")).await.unwrap();
    // Enters the selection.
    let c = reg.update_with_name(&ctx, "a", &c.with_label("env", "prod")).await.unwrap();
    match next(&mut w).await {
        WatchEvent::Added(o) => assert_eq!(o.metadata.resource_version, "2"),
        other => panic!("unexpected {other:?}"),
    }
    let c = reg.update_with_name(&ctx, "a", &c.with_flag("k", "v")).await.unwrap();
    assert!(matches!(next(&mut w).await, WatchEvent::Modified(_)));
    // Leaves the selection: reported as a delete of the previous state.
    reg.update_with_name(&ctx, "a", &c.with_label("env", "dev")).await.unwrap();
    match next(&mut w).await {
        WatchEvent::Deleted(o) => {
            assert_eq!(o.metadata.labels.get("env").map(String::as_str), Some("prod"));
            assert_eq!(o.metadata.resource_version, "4");
        }
        other => panic!("unexpected {other:?}"),
    }
    // A delete of a non-matching object is invisible.
    reg.delete(&ctx, "a", &DeleteOptions::default()).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), w.recv()).await.is_err());
}

#[tokio::test]
async fn watch_from_version_replays_history() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let list_rv = {
        reg.create_with_name(&ctx, "a", &Configuration::new("a", "t")).await.unwrap();
        reg.list_predicate(&ctx, &SelectionPredicate::everything(attrs())).await.unwrap().metadata.resource_version
    };
    reg.create_with_name(&ctx, "b", &Configuration::new("b", "t")).await.unwrap();
    reg.delete(&ctx, "a", &DeleteOptions::default()).await.unwrap();

    let mut w = reg.watch_predicate(&ctx, SelectionPredicate::everything(attrs()), &list_rv).await.unwrap();
    match next(&mut w).await {
        WatchEvent::Added(o) => assert_eq!(o.metadata.name, "b"),
        other => panic!("unexpected {other:?}"),
    }
    match next(&mut w).await {
        WatchEvent::Deleted(o) => {
            assert_eq!(o.metadata.name, "a");
            assert_eq!(o.metadata.resource_version, "3");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn watch_with_bad_version_is_bad_request() {
    let (_, reg) = registry();
    let err = reg.watch_predicate(&Context::new(), SelectionPredicate::everything(attrs()), "x1").await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn cancelling_context_ends_watch() {
    let (_, reg) = registry();
    let token = CancellationToken::new();
    let ctx = Context::new().with_cancel(token.clone());
    let mut w = reg.watch_predicate(&ctx, SelectionPredicate::everything(attrs()), "").await.unwrap();
    token.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), w.recv()).await.unwrap();
    assert!(end.is_none());
    // Writes proceed with nobody listening.
    reg.create_with_name(&Context::new(), "a", &Configuration::new("a", "t")).await.unwrap();
}

async fn settle_watchers(reg: &Registry<Configuration>, want: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while reg.store().watchers().unwrap() != want {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("store subscription still held");
}

#[tokio::test]
async fn dropping_watch_releases_store_subscription() {
    let (_, reg) = registry();
    let ctx = Context::new();
    let w = reg.watch_predicate(&ctx, label("env=prod"), "").await.unwrap();
    assert_eq!(reg.store().watchers().unwrap(), 1);
    drop(w);
    settle_watchers(&reg, 0).await;

    // Same once the context cancels an open watch.
    let token = CancellationToken::new();
    let mut w = reg.watch_predicate(&Context::new().with_cancel(token.clone()), label("env=prod"), "").await.unwrap();
    assert_eq!(reg.store().watchers().unwrap(), 1);
    token.cancel();
    assert!(tokio::time::timeout(Duration::from_secs(5), w.recv()).await.unwrap().is_none());
    settle_watchers(&reg, 0).await;
}

#[tokio::test]
async fn cancelled_context_fails_fast() {
    let (store, reg) = registry();
    let token = CancellationToken::new();
    token.cancel();
    let ctx = Context::new().with_cancel(token);
    let err = reg.create_with_name(&ctx, "a", &Configuration::new("a", "t")).await.unwrap_err();
    assert_eq!(err, ApiError::Cancelled);
    assert_eq!(store.revision().await.unwrap(), 0);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct Widget {
    #[serde(flatten)]
    type_meta: TypeMeta,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    size: u32,
}

impl Resource for Widget {
    const KIND: &'static str = "Widget";
    const API_VERSION: &'static str = "test/v1";
    const PLURAL: &'static str = "widgets";
    const NAMESPACED: bool = true;

    fn type_meta(&self) -> &TypeMeta {
        &self.type_meta
    }

    fn type_meta_mut(&mut self) -> &mut TypeMeta {
        &mut self.type_meta
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[tokio::test]
async fn namespaced_registry_scopes_by_context() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::default());
    let reg: Registry<Widget> = Registry::namespaced(store.clone(), "/registry/widgets");
    let a = Context::new().with_namespace("a");
    let b = Context::new().with_namespace("b");
    let w = Widget { size: 3, ..Default::default() };

    reg.create_with_name(&a, "w", &w).await.unwrap();
    reg.create_with_name(&b, "w", &w).await.unwrap();
    assert!(store.get("/registry/widgets/a/w").await.unwrap().is_some());

    let attrs: AttrFn<Widget> = Arc::new(|w: &Widget| (w.metadata.labels.clone(), Set::new()));
    let in_a = reg.list_predicate(&a, &SelectionPredicate::everything(attrs)).await.unwrap();
    assert_eq!(in_a.items.len(), 1);
    assert_eq!(in_a.type_meta.kind, "WidgetList");

    // Namespace is required for keyed operations on a namespaced kind.
    assert!(matches!(reg.get(&Context::new(), "w").await, Err(ApiError::BadRequest(_))));
}
