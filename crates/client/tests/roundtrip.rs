#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_api::{app, serve, ApiConfig};
use keel_client::{Client, ClientError, ClientWatch, ConfigurationInterface};
use keel_core::config::Tunables;
use keel_core::{ApiError, Configuration, DeleteOptions, Selector, WatchEvent};
use keel_store::{KvStore, MemStore};
use tokio::net::TcpListener;

async fn start(store: MemStore) -> Client {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(Arc::new(store) as Arc<dyn KvStore>, ApiConfig::default());
    tokio::spawn(serve(listener, router, std::future::pending()));
    Client::new(format!("http://{}", addr))
}

fn sel(s: &str) -> Selector { Selector::parse(s).unwrap() }

async fn next(w: &mut ClientWatch<Configuration>) -> Result<WatchEvent<Configuration>, ClientError> {
    tokio::time::timeout(Duration::from_secs(5), w.recv()).await.expect("watch stalled").expect("watch closed")
}

#[tokio::test]
async fn crud_over_http() {
    let client = start(MemStore::default()).await;
    let cfgs = client.configurations();

    let created = cfgs.create(&Configuration::new("db", "postgres").with_flag("max_conn", "10")).await.unwrap();
    assert!(!created.metadata.uid.is_empty());
    assert_eq!(cfgs.get("db").await.unwrap(), created);

    let updated = cfgs.update(&created.clone().with_flag("max_conn", "20")).await.unwrap();
    assert_eq!(updated.flags.get("max_conn").map(String::as_str), Some("20"));

    // The first version is now stale.
    let err = cfgs.update(&created.with_flag("max_conn", "30")).await.unwrap_err();
    assert!(matches!(err.api(), Some(ApiError::VersionMismatch { .. })), "{err:?}");

    let stale = DeleteOptions { resource_version: Some("1".into()) };
    assert!(matches!(cfgs.delete_with("db", &stale).await.unwrap_err().api(), Some(ApiError::VersionMismatch { .. })));
    let gone = cfgs.delete("db").await.unwrap();
    assert_eq!(gone.metadata.uid, updated.metadata.uid);

    let err = cfgs.get("db").await.unwrap_err();
    assert!(err.api().map(ApiError::is_not_found).unwrap_or(false), "{err:?}");
}

#[tokio::test]
async fn list_with_selectors() {
    let client = start(MemStore::default()).await;
    let cfgs = client.configurations();
    cfgs.create(&Configuration::new("a", "foo").with_label("env", "prod")).await.unwrap();
    cfgs.create(&Configuration::new("b", "bar").with_label("env", "prod")).await.unwrap();
    cfgs.create(&Configuration::new("c", "foo").with_label("env", "dev")).await.unwrap();

    let all = cfgs.list(&Selector::everything(), &Selector::everything()).await.unwrap();
    assert_eq!(all.items.len(), 3);
    assert_eq!(all.type_meta.kind, "ConfigurationList");

    let foo = cfgs.list(&Selector::everything(), &sel("type=foo")).await.unwrap();
    let names: Vec<_> = foo.items.iter().map(|c| c.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);

    let both = cfgs.list(&sel("env=prod"), &sel("type=foo")).await.unwrap();
    assert_eq!(both.items.len(), 1);
    assert_eq!(both.items[0].metadata.name, "a");
}

#[tokio::test]
async fn error_statuses_map_to_api_errors() {
    let client = start(MemStore::default()).await;
    let cfgs = client.configurations();

    let err = cfgs.create(&Configuration::new("bad name", "")).await.unwrap_err();
    match err {
        ClientError::Api(ApiError::Invalid { causes, .. }) => assert_eq!(causes.len(), 2),
        other => panic!("unexpected {other:?}"),
    }

    let mut namespaced = Configuration::new("x", "t");
    namespaced.metadata.namespace = "ns".into();
    assert!(matches!(cfgs.create(&namespaced).await.unwrap_err().api(), Some(ApiError::Conflict { .. })));

    cfgs.create(&Configuration::new("x", "t")).await.unwrap();
    assert!(matches!(cfgs.create(&Configuration::new("x", "t")).await.unwrap_err().api(), Some(ApiError::AlreadyExists { .. })));
    assert!(cfgs.update(&Configuration::new("ghost", "t")).await.unwrap_err().api().map(ApiError::is_not_found).unwrap_or(false));
}

#[tokio::test]
async fn unreachable_server_is_http_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = Client::new(format!("http://{}", addr)).configurations().get("x").await.unwrap_err();
    assert!(matches!(err, ClientError::Http(_)), "{err:?}");
}

#[tokio::test]
async fn watch_sees_predicate_transitions() {
    let client = start(MemStore::default()).await;
    let cfgs = client.configurations();
    let mut w = cfgs.watch(&sel("env=prod"), &Selector::everything(), "").await.unwrap();

    let b = cfgs.create(&Configuration::new("b", "foo").with_label("env", "prod")).await.unwrap();
    match next(&mut w).await.unwrap() {
        WatchEvent::Added(o) => assert_eq!(o.metadata.name, "b"),
        other => panic!("unexpected {other:?}"),
    }
    let b = cfgs.update(&b.with_flag("k", "v")).await.unwrap();
    assert!(matches!(next(&mut w).await.unwrap(), WatchEvent::Modified(_)));

    cfgs.update(&b.with_label("env", "dev")).await.unwrap();
    match next(&mut w).await.unwrap() {
        WatchEvent::Deleted(o) => assert_eq!(o.metadata.labels.get("env").map(String::as_str), Some("prod")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn watch_resumes_from_list_version() {
    let client = start(MemStore::default()).await;
    let cfgs = client.configurations();
    cfgs.create(&Configuration::new("a", "t")).await.unwrap();
    let rv = cfgs.list(&Selector::everything(), &Selector::everything()).await.unwrap().metadata.resource_version;
    cfgs.create(&Configuration::new("b", "t")).await.unwrap();

    let mut w = cfgs.watch(&Selector::everything(), &Selector::everything(), &rv).await.unwrap();
    match next(&mut w).await.unwrap() {
        WatchEvent::Added(o) => assert_eq!(o.metadata.name, "b"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn compacted_watch_is_gone() {
    let client = start(MemStore::with_tunables(&Tunables { watch_history: 1, ..Tunables::default() })).await;
    let cfgs = client.configurations();
    for n in ["a", "b", "c"] {
        cfgs.create(&Configuration::new(n, "t")).await.unwrap();
    }
    let err = match cfgs.watch(&Selector::everything(), &Selector::everything(), "1").await {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(matches!(err.api(), Some(ApiError::Gone(_))), "{err:?}");
}

#[tokio::test]
async fn trait_object_dispatch() {
    let client = start(MemStore::default()).await;
    let iface: Box<dyn ConfigurationInterface> = Box::new(client.configurations());
    iface.create(&Configuration::new("a", "t")).await.unwrap();
    assert_eq!(iface.get("a").await.unwrap().type_, "t");
    iface.delete("a").await.unwrap();
    assert!(iface.get("a").await.is_err());
}
