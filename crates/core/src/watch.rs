//! Watch events and the cancellable stream handle used at every layer.

use std::fmt;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Status;

/// One change notification for a watched kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    Error(Status),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => Some(o),
            Self::Error(_) => None,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
            Self::Error(_) => "ERROR",
        }
    }
}

/// Receiving end of a producer task. Dropping it (or calling `cancel`) aborts the
/// producer, which in turn drops whatever upstream subscription it holds.
pub struct Watch<T> {
    rx: mpsc::Receiver<T>,
    task: Option<JoinHandle<()>>,
}

impl<T> Watch<T> {
    pub fn new(rx: mpsc::Receiver<T>, task: JoinHandle<()>) -> Self {
        Self { rx, task: Some(task) }
    }

    /// Next item, or `None` once the producer finished.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }

    /// Whether the producer task is gone (finished or aborted).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").field("finished", &self.is_finished()).finish()
    }
}

impl<T> Unpin for Watch<T> {}

impl<T> futures::Stream for Watch<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
