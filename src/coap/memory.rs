//! In-process transport for rehearsals and tests.
//!
//! Replies are scripted per `(host, path)`, every request is recorded, and observations are
//! fed explicitly through [`MemoryCoapClient::notify`].

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::{
    CoapClient, Notification, Request, Response, Subscription, TransportError, TransportResult,
};

const NOTIFICATION_BUFFER: usize = 32;

#[derive(Debug, Clone)]
enum Reply {
    Payload { source: Option<String>, payload: Vec<u8> },
    Failure,
}

#[derive(Default)]
struct Inner {
    replies: DashMap<(String, String), Reply>,
    requests: Mutex<Vec<Request>>,
    observers: DashMap<String, mpsc::Sender<Notification>>,
    refused: DashSet<String>,
    released: Mutex<Vec<String>>,
}

/// Scripted [`CoapClient`] keeping everything in memory.
///
/// Requests without a scripted reply are acknowledged with an empty payload.
#[derive(Clone, Default)]
pub struct MemoryCoapClient {
    inner: Arc<Inner>,
}

impl MemoryCoapClient {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests for `host` + `path` with `payload`.
    pub fn respond(&self, host: &str, path: &str, payload: impl Into<Vec<u8>>) {
        self.inner.replies.insert(
            (host.to_owned(), path.to_owned()),
            Reply::Payload {
                source: None,
                payload: payload.into(),
            },
        );
    }

    /// Answer requests for `host` + `path` as if `source` had replied (multicast lookups).
    pub fn respond_from(&self, host: &str, path: &str, source: &str, payload: impl Into<Vec<u8>>) {
        self.inner.replies.insert(
            (host.to_owned(), path.to_owned()),
            Reply::Payload {
                source: Some(source.to_owned()),
                payload: payload.into(),
            },
        );
    }

    /// Make requests for `host` + `path` time out.
    pub fn fail(&self, host: &str, path: &str) {
        self.inner
            .replies
            .insert((host.to_owned(), path.to_owned()), Reply::Failure);
    }

    /// Refuse observations of `host`.
    pub fn refuse_observe(&self, host: &str) {
        self.inner.refused.insert(host.to_owned());
    }

    /// Push a notification to the observer of `host`. Returns `false` when nobody observes it.
    pub async fn notify(&self, host: &str, payload: impl Into<Vec<u8>>) -> bool {
        let Some(sender) = self.inner.observers.get(host).map(|entry| entry.value().clone()) else {
            return false;
        };
        sender
            .send(Notification {
                source: host.to_owned(),
                payload: payload.into(),
            })
            .await
            .is_ok()
    }

    /// Whether `host` currently has a live observation.
    pub fn is_observed(&self, host: &str) -> bool {
        self.inner.observers.contains_key(host)
    }

    /// Every request sent so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.inner.requests).clone()
    }

    /// Hosts that received a request on `path`, in order.
    pub fn hosts_requested(&self, path: &str) -> Vec<String> {
        lock(&self.inner.requests)
            .iter()
            .filter(|request| request.path == path)
            .map(|request| request.host.clone())
            .collect()
    }

    /// Hosts whose observation was released, in release order.
    pub fn released(&self) -> Vec<String> {
        lock(&self.inner.released).clone()
    }
}

impl CoapClient for MemoryCoapClient {
    fn request(&self, request: Request) -> BoxFuture<'static, TransportResult<Response>> {
        // Recorded on call so fire-and-forget deliveries are visible before they run.
        lock(&self.inner.requests).push(request.clone());
        let inner = self.inner.clone();
        Box::pin(async move {
            let reply = inner
                .replies
                .get(&(request.host.clone(), request.path.clone()))
                .map(|entry| entry.value().clone());
            match reply {
                Some(Reply::Payload { source, payload }) => Ok(Response {
                    source: source.unwrap_or_else(|| request.host.clone()),
                    payload,
                }),
                Some(Reply::Failure) => Err(TransportError::Timeout {
                    host: request.host,
                    path: request.path,
                }),
                None => Ok(Response {
                    source: request.host,
                    payload: Vec::new(),
                }),
            }
        })
    }

    fn observe(&self, host: &str, path: &str) -> BoxFuture<'static, TransportResult<Subscription>> {
        let inner = self.inner.clone();
        let host = host.to_owned();
        let path = path.to_owned();
        Box::pin(async move {
            if inner.refused.contains(&host) {
                return Err(TransportError::Status {
                    host,
                    path,
                    code: "NotFound".into(),
                });
            }

            let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
            inner.observers.insert(host.clone(), tx);

            let released_host = host.clone();
            let release_inner = inner.clone();
            Ok(Subscription::new(host, path, rx, move || {
                release_inner.observers.remove(&released_host);
                lock(&release_inner.released).push(released_host);
            }))
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_replies_and_defaults() {
        let client = MemoryCoapClient::new();
        client.respond_from("[ff02::1]", "/.well-known/core", "[2001:db8::9]", "");
        client.fail("h2", "/assign_color");

        let lookup = client
            .request(Request::get("[ff02::1]", "/.well-known/core").non_confirmable())
            .await
            .unwrap();
        assert_eq!(lookup.source, "[2001:db8::9]");

        assert!(client.request(Request::post("h1", "/start")).await.is_ok());
        assert!(matches!(
            client
                .request(Request::put("h2", "/assign_color", b"2".to_vec()))
                .await,
            Err(TransportError::Timeout { .. })
        ));
        assert_eq!(client.hosts_requested("/start"), vec!["h1".to_string()]);
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn observation_lifecycle_is_recorded() {
        let client = MemoryCoapClient::new();
        client.refuse_observe("h2");
        assert!(client.observe("h2", "/count").await.is_err());

        let mut subscription = client.observe("h1", "/count").await.unwrap();
        assert!(client.is_observed("h1"));
        assert!(client.notify("h1", "4").await);
        assert_eq!(subscription.next().await.unwrap().payload, b"4");

        drop(subscription);
        assert!(!client.is_observed("h1"));
        assert!(!client.notify("h1", "5").await);
        assert_eq!(client.released(), vec!["h1".to_string()]);
    }
}
