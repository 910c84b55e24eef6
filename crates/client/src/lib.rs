//! Keel typed client over the HTTP surface.
//!
//! Server errors come back as [`ClientError::Api`] carrying the server's `ApiError`.
//! Nothing here retries or reconnects.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use keel_core::{
    ApiError, Configuration, ConfigurationList, DeleteOptions, ObjectList, Resource, Selector, Status, Watch, WatchEvent,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl ClientError {
    /// The server-side error, when there is one.
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Event stream returned by `watch`; ends after the first `Err`.
pub type ClientWatch<T> = Watch<ClientResult<WatchEvent<T>>>;

const WATCH_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self { http, base }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn resource<T: Resource>(&self) -> ResourceClient<T> {
        ResourceClient { client: self.clone(), _kind: PhantomData }
    }

    pub fn configurations(&self) -> ResourceClient<Configuration> {
        self.resource()
    }
}

/// Typed access to one kind's collection.
#[derive(Debug, Clone)]
pub struct ResourceClient<T> {
    client: Client,
    _kind: PhantomData<fn() -> T>,
}

fn selector_query(label: &Selector, field: &Selector, resource_version: &str) -> Vec<(&'static str, String)> {
    let mut q = Vec::new();
    if !label.is_empty() {
        q.push(("labelSelector", label.to_string()));
    }
    if !field.is_empty() {
        q.push(("fieldSelector", field.to_string()));
    }
    if !resource_version.is_empty() {
        q.push(("resourceVersion", resource_version.to_string()));
    }
    q
}

fn error_from(status: u16, body: &[u8]) -> ClientError {
    match serde_json::from_slice::<Status>(body) {
        Ok(s) => ClientError::Api(s.error),
        Err(_) => ClientError::UnexpectedStatus { status, body: String::from_utf8_lossy(body).into_owned() },
    }
}

async fn decode<R: DeserializeOwned>(resp: reqwest::Response) -> ClientResult<R> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        return Err(error_from(status.as_u16(), &body));
    }
    Ok(serde_json::from_slice(&body)?)
}

impl<T: Resource> ResourceClient<T> {
    fn collection_url(&self) -> String {
        format!("{}/{}", self.client.base, T::PLURAL)
    }

    fn item_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.client.base, T::PLURAL, name)
    }

    async fn send<R: DeserializeOwned>(&self, op: &'static str, req: reqwest::RequestBuilder) -> ClientResult<R> {
        let t0 = Instant::now();
        let res = decode(req.send().await?).await;
        debug!(kind = T::KIND, op, ok = res.is_ok(), took_ms = %t0.elapsed().as_millis(), "client: request done");
        res
    }

    pub async fn get(&self, name: &str) -> ClientResult<T> {
        self.send("get", self.client.http.get(self.item_url(name))).await
    }

    pub async fn list(&self, label: &Selector, field: &Selector) -> ClientResult<ObjectList<T>> {
        let req = self.client.http.get(self.collection_url()).query(&selector_query(label, field, ""));
        self.send("list", req).await
    }

    pub async fn create(&self, obj: &T) -> ClientResult<T> {
        self.send("create", self.client.http.post(self.collection_url()).json(obj)).await
    }

    pub async fn update(&self, obj: &T) -> ClientResult<T> {
        self.send("update", self.client.http.put(self.item_url(obj.name())).json(obj)).await
    }

    pub async fn delete(&self, name: &str) -> ClientResult<T> {
        self.delete_with(name, &DeleteOptions::default()).await
    }

    /// Delete with an optional resourceVersion precondition; returns the deleted object.
    pub async fn delete_with(&self, name: &str, opts: &DeleteOptions) -> ClientResult<T> {
        let mut req = self.client.http.delete(self.item_url(name));
        if let Some(rv) = opts.resource_version.as_deref().filter(|rv| !rv.is_empty()) {
            req = req.query(&[("resourceVersion", rv)]);
        }
        self.send("delete", req).await
    }

    /// Open a watch. The returned stream yields events until the server ends the
    /// response; an `ERROR` frame or a transport/decode failure is delivered as one
    /// `Err` and ends the stream.
    pub async fn watch(&self, label: &Selector, field: &Selector, resource_version: &str) -> ClientResult<ClientWatch<T>> {
        let url = format!("{}/watch/{}", self.client.base, T::PLURAL);
        let resp = self.client.http.get(url).query(&selector_query(label, field, resource_version)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await?;
            return Err(error_from(status.as_u16(), &body));
        }
        debug!(kind = T::KIND, rv = %resource_version, "client: watch open");
        let mut body = resp.bytes_stream();
        let (tx, rx) = mpsc::channel(WATCH_QUEUE);
        let task = tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            'read: loop {
                let chunk = match body.next().await {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ClientError::Http(e))).await;
                        break;
                    }
                    None => break,
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let item = match serde_json::from_slice::<WatchEvent<T>>(&line) {
                        Ok(WatchEvent::Error(status)) => Err(ClientError::Api(status.error)),
                        Ok(ev) => Ok(ev),
                        Err(e) => Err(ClientError::Decode(e)),
                    };
                    let terminal = item.is_err();
                    if tx.send(item).await.is_err() || terminal {
                        break 'read;
                    }
                }
            }
            debug!(kind = T::KIND, "client: watch closed");
        });
        Ok(Watch::new(rx, task))
    }
}

/// Configuration operations, as exposed to callers that want a trait object.
#[async_trait]
pub trait ConfigurationInterface: Send + Sync {
    async fn get(&self, name: &str) -> ClientResult<Configuration>;
    async fn create(&self, cfg: &Configuration) -> ClientResult<Configuration>;
    async fn list(&self, label: &Selector, field: &Selector) -> ClientResult<ConfigurationList>;
    async fn delete(&self, name: &str) -> ClientResult<Configuration>;
    async fn update(&self, cfg: &Configuration) -> ClientResult<Configuration>;
    async fn watch(&self, label: &Selector, field: &Selector, resource_version: &str) -> ClientResult<ClientWatch<Configuration>>;
}

#[async_trait]
impl ConfigurationInterface for ResourceClient<Configuration> {
    async fn get(&self, name: &str) -> ClientResult<Configuration> {
        ResourceClient::get(self, name).await
    }

    async fn create(&self, cfg: &Configuration) -> ClientResult<Configuration> {
        ResourceClient::create(self, cfg).await
    }

    async fn list(&self, label: &Selector, field: &Selector) -> ClientResult<ConfigurationList> {
        ResourceClient::list(self, label, field).await
    }

    async fn delete(&self, name: &str) -> ClientResult<Configuration> {
        ResourceClient::delete(self, name).await
    }

    async fn update(&self, cfg: &Configuration) -> ClientResult<Configuration> {
        ResourceClient::update(self, cfg).await
    }

    async fn watch(&self, label: &Selector, field: &Selector, resource_version: &str) -> ClientResult<ClientWatch<Configuration>> {
        ResourceClient::watch(self, label, field, resource_version).await
    }
}
