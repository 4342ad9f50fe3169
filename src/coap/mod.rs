//! Minimal CoAP client abstraction used to talk to the resource directory and the players.
//!
//! The referee only needs three interactions: a one-shot request/response exchange, a
//! multicast lookup answered by the first responder, and long-lived observations. Concrete
//! transports live in [`udp`] (real network) and [`memory`] (scripted, in-process).

pub mod memory;
pub mod udp;

use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Stream, future::BoxFuture};
use thiserror::Error;
use tokio::sync::mpsc;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures raised by a [`CoapClient`] regardless of the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The host string could not be resolved to a socket address.
    #[error("failed to resolve `{host}`")]
    Resolve {
        /// Host string as given.
        host: String,
        /// Resolver failure.
        #[source]
        source: io::Error,
    },
    /// Resolution succeeded but returned no usable address.
    #[error("no address found for `{host}`")]
    Unresolved {
        /// Host string as given.
        host: String,
    },
    /// Socket level failure while exchanging datagrams.
    #[error("socket error while talking to `{host}`")]
    Io {
        /// Host the socket talked to.
        host: String,
        /// Socket failure.
        #[source]
        source: io::Error,
    },
    /// The request could not be serialized into a CoAP message.
    #[error("failed to encode request for `{path}`: {message}")]
    Encode {
        /// Resource path of the request.
        path: String,
        /// Codec error description.
        message: String,
    },
    /// No matching response arrived in time.
    #[error("request to `{host}{path}` timed out")]
    Timeout {
        /// Addressed host.
        host: String,
        /// Requested resource path.
        path: String,
    },
    /// The peer answered with a non-success response code.
    #[error("`{host}{path}` answered with {code}")]
    Status {
        /// Addressed host.
        host: String,
        /// Requested resource path.
        path: String,
        /// Response code as reported by the codec.
        code: String,
    },
}

/// Request methods used by the referee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Trigger an action.
    Post,
    /// Write a value.
    Put,
}

/// Outbound CoAP request addressed to a host and resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Host info of the target, a name or an address literal.
    pub host: String,
    /// Resource path, split into Uri-Path options on the wire.
    pub path: String,
    /// Optional query, split on `&` into Uri-Query options.
    pub query: Option<String>,
    /// Request body.
    pub payload: Vec<u8>,
    /// Whether the message is sent confirmable. Multicast lookups must not be.
    pub confirmable: bool,
}

impl Request {
    fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            query: None,
            payload: Vec::new(),
            confirmable: true,
        }
    }

    /// Build a GET request.
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Get, host, path)
    }

    /// Build a POST request without payload.
    pub fn post(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Post, host, path)
    }

    /// Build a PUT request carrying `payload`.
    pub fn put(host: impl Into<String>, path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::new(Method::Put, host, path)
        }
    }

    /// Attach a `&`-separated query string.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Send the request as a non-confirmable message.
    pub fn non_confirmable(mut self) -> Self {
        self.confirmable = false;
        self
    }
}

/// Successful response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Host info of the responder, in the same form the referee uses for identities.
    pub source: String,
    /// Response body.
    pub payload: Vec<u8>,
}

/// Value pushed by an observed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Host the subscription targeted. Transports only deliver datagrams originating from it.
    pub source: String,
    /// Notification body.
    pub payload: Vec<u8>,
}

/// Scoped handle over a live observation.
///
/// Notifications are consumed through the [`Stream`] implementation. Dropping the handle
/// releases the observation on the transport, so every exit path cancels it.
pub struct Subscription {
    host: String,
    path: String,
    notifications: mpsc::Receiver<Notification>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a notification channel and the callback that tears the observation down.
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        notifications: mpsc::Receiver<Notification>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            notifications,
            release: Some(Box::new(release)),
        }
    }

    /// Host this subscription observes.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Observed resource path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Stream for Subscription {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        self.notifications.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Abstraction over the CoAP transport used by the referee.
pub trait CoapClient: Send + Sync {
    /// Send a request and wait for the matching response from any source.
    fn request(&self, request: Request) -> BoxFuture<'static, TransportResult<Response>>;
    /// Register an observation on `host` + `path` and return once the first response arrived.
    fn observe(&self, host: &str, path: &str) -> BoxFuture<'static, TransportResult<Subscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    #[tokio::test]
    async fn dropping_subscription_runs_release_once() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = Subscription::new("h1", "/count", rx, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        tx.send(Notification {
            source: "h1".into(),
            payload: b"3".to_vec(),
        })
        .await
        .unwrap();
        let received = subscription.next().await.unwrap();
        assert_eq!(received.payload, b"3");
        assert!(!released.load(Ordering::SeqCst));

        drop(subscription);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn request_builders_set_method_and_payload() {
        let put = Request::put("h1", "/assign_color", b"2".to_vec());
        assert_eq!(put.method, Method::Put);
        assert_eq!(put.payload, b"2");
        assert!(put.confirmable);

        let lookup = Request::get("[ff02::1]", "/.well-known/core")
            .with_query("rt=core.rd*")
            .non_confirmable();
        assert_eq!(lookup.query.as_deref(), Some("rt=core.rd*"));
        assert!(!lookup.confirmable);
    }
}
