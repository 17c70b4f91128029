//! Inbound dispatch through an in-process axum router.
//!
//! Every inbound envelope becomes a synthetic `POST <path>` request with the
//! payload as a JSON body. Handlers are plain axum handlers, so they can be
//! exercised with a hand-built request and no stream at all.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::handler::Handler;
use axum::http::{Method, Request, header};
use axum::routing::{MethodRouter, post};
use parking_lot::RwLock;
use proto::DispatchError;
use tower::ServiceExt;
use tracing::{debug, error, warn};

use crate::route::RouteTable;
use crate::transport::InboundSink;

/// Largest handler response body the dispatcher will buffer.
pub const MAX_RESPONSE_LEN: usize = 1_048_576;

/// Content type attached to every synthetic request.
pub const DISPATCH_CONTENT_TYPE: &str = "application/json";

struct Bindings {
    /// path -> handler, one per path
    handlers: HashMap<&'static str, MethodRouter>,
    /// router rebuilt from `handlers` on every registration
    router: Router,
}

/// Resolves message ids through a [`RouteTable`] and invokes the handler bound
/// at the resulting path.
pub struct Dispatcher {
    routes: RouteTable,
    bindings: RwLock<Bindings>,
}

impl Dispatcher {
    /// Creates a dispatcher with no handlers bound.
    pub fn new(routes: RouteTable) -> Self {
        Self {
            routes,
            bindings: RwLock::new(Bindings {
                handlers: HashMap::new(),
                router: Router::new(),
            }),
        }
    }

    /// Route table used for resolution.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Binds `handler` to the path of `msg_id`.
    ///
    /// Fails for ids missing from the route table and for paths that are not
    /// plain absolute paths. A second registration for the same path replaces
    /// the first.
    pub fn register_handler<H, T>(&self, msg_id: u32, handler: H) -> Result<(), DispatchError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let Some(path) = self.routes.resolve(msg_id) else {
            error!(msg_id, "Invalid route, handler registration ignored");
            return Err(DispatchError::UnknownMsgId(msg_id));
        };

        if !is_bindable(path) {
            error!(msg_id, path, "Route path cannot be bound, handler registration ignored");
            return Err(DispatchError::InvalidRoute(path.to_string()));
        }

        let mut bindings = self.bindings.write();
        if bindings.handlers.insert(path, post(handler)).is_some() {
            warn!(msg_id, path, "Replacing previously registered handler");
        }
        let router = bindings
            .handlers
            .iter()
            .fold(Router::new(), |router, (path, handler)| {
                router.route(path, handler.clone())
            });
        bindings.router = router;
        debug!(msg_id, path, "Handler registered");
        Ok(())
    }

    /// Returns `true` if a handler is bound for `msg_id`.
    pub fn has_handler(&self, msg_id: u32) -> bool {
        self.routes
            .resolve(msg_id)
            .is_some_and(|path| self.bindings.read().handlers.contains_key(path))
    }

    /// Dispatches `payload` to the handler bound for `msg_id` and returns the
    /// handler's response body.
    pub async fn dispatch(&self, msg_id: u32, payload: Vec<u8>) -> Result<Bytes, DispatchError> {
        let Some(path) = self.routes.resolve(msg_id) else {
            error!(msg_id, "Dispatch: invalid msg id");
            return Err(DispatchError::UnknownMsgId(msg_id));
        };

        let router = {
            let bindings = self.bindings.read();
            if !bindings.handlers.contains_key(path) {
                warn!(msg_id, path, "Dispatch: no handler registered");
                return Err(DispatchError::NoHandler(path.to_string()));
            }
            bindings.router.clone()
        };

        let request = request_for(path, payload)?;
        let response = router
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {});

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), MAX_RESPONSE_LEN)
            .await
            .map_err(|e| DispatchError::Response(e.to_string()))?;

        if !status.is_success() {
            warn!(msg_id, path, %status, "Handler returned non-success status");
        }
        Ok(body)
    }
}

#[async_trait]
impl InboundSink for Dispatcher {
    async fn deliver(&self, msg_id: u32, payload: Vec<u8>) {
        // response bodies are not sent back over the stream
        let _ = self.dispatch(msg_id, payload).await;
    }
}

/// Route paths are matched literally: absolute, no captures or wildcards.
fn is_bindable(path: &str) -> bool {
    path.starts_with('/')
        && path.bytes().all(|b| b.is_ascii_graphic())
        && !path.contains(['{', '}'])
        && !path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
}

/// Builds the request the dispatcher sends for `path`.
pub fn request_for(path: &str, payload: impl Into<Body>) -> Result<Request<Body>, DispatchError> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, DISPATCH_CONTENT_TYPE)
        .body(payload.into())
        .map_err(|e| DispatchError::Request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap, StatusCode, Uri};
    use proto::msg_id;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Debug)]
    struct Seen {
        method: Method,
        path: String,
        content_type: Option<String>,
        body: Bytes,
    }

    fn recording_handler(
        tx: mpsc::UnboundedSender<Seen>,
    ) -> impl Fn(Method, Uri, HeaderMap, Bytes) -> std::future::Ready<&'static str> + Clone {
        move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
            let _ = tx.send(Seen {
                method,
                path: uri.path().to_string(),
                content_type: headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                body,
            });
            std::future::ready("ack")
        }
    }

    #[test]
    fn register_rejects_unknown_msg_id() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        let err = dispatcher
            .register_handler(4242, || async { "never" })
            .expect_err("unknown id should be rejected");
        assert!(matches!(err, DispatchError::UnknownMsgId(4242)));
        assert!(!dispatcher.has_handler(4242));
    }

    #[test]
    fn register_rejects_connect_request() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        assert!(
            dispatcher
                .register_handler(msg_id::CONNECT_REQ, || async { "never" })
                .is_err()
        );
    }

    #[test]
    fn register_rejects_paths_the_router_cannot_bind() {
        let dispatcher = Dispatcher::new(RouteTable::from_entries(&[
            (7, "seven"),
            (8, "/:x"),
            (9, "/steps/{id}"),
            (10, "/files/*rest"),
            (11, "/with space"),
            (12, "/ok/nested"),
        ]));
        for id in 7..=11 {
            let err = dispatcher
                .register_handler(id, || async { "never" })
                .expect_err("path should be rejected");
            assert!(matches!(err, DispatchError::InvalidRoute(_)), "id {id}: {err}");
            assert!(!dispatcher.has_handler(id));
        }
        dispatcher
            .register_handler(12, || async { "ok" })
            .expect("literal path binds");
        assert!(dispatcher.has_handler(12));
    }

    #[test]
    fn bindable_paths_are_absolute_literals() {
        assert!(is_bindable("/"));
        assert!(is_bindable("/worker/heartbeat"));
        assert!(!is_bindable(""));
        assert!(!is_bindable("heartbeat"));
        assert!(!is_bindable("/a/:b"));
        assert!(!is_bindable("/a/{b}"));
        assert!(!is_bindable("/a/*b"));
    }

    #[tokio::test]
    async fn dispatch_invokes_handler_with_path_and_exact_body() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .register_handler(msg_id::WORKER_HEARTBEAT_RESP, recording_handler(tx))
            .expect("register");

        let payload = vec![b'{', 0, 255, b'}'];
        let body = dispatcher
            .dispatch(msg_id::WORKER_HEARTBEAT_RESP, payload.clone())
            .await
            .expect("dispatch");
        assert_eq!(&body[..], b"ack");

        let seen = rx.try_recv().expect("handler should run");
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.path, "/worker/heartbeat");
        assert_eq!(seen.content_type.as_deref(), Some("application/json"));
        assert_eq!(&seen.body[..], &payload[..]);
    }

    #[tokio::test]
    async fn dispatch_unknown_msg_id_returns_error_without_invoking() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .register_handler(msg_id::NODE_HEARTBEAT_RESP, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { "ok" }
            })
            .expect("register");

        let err = dispatcher
            .dispatch(31337, b"{}".to_vec())
            .await
            .expect_err("unknown id");
        assert!(matches!(err, DispatchError::UnknownMsgId(31337)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_without_handler_reports_missing_binding() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        let err = dispatcher
            .dispatch(msg_id::TEST_STEP_UPDATE_RESP, Vec::new())
            .await
            .expect_err("no handler bound");
        assert!(err.to_string().contains("/testStepUpdate"));
    }

    #[tokio::test]
    async fn later_registration_replaces_handler() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        dispatcher
            .register_handler(msg_id::NODE_HEARTBEAT_RESP, || async { "first" })
            .expect("first");
        dispatcher
            .register_handler(msg_id::NODE_HEARTBEAT_RESP, || async { "second" })
            .expect("second");

        let body = dispatcher
            .dispatch(msg_id::NODE_HEARTBEAT_RESP, Vec::new())
            .await
            .expect("dispatch");
        assert_eq!(&body[..], b"second");
    }

    #[tokio::test]
    async fn handlers_on_other_paths_survive_rebuild() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        dispatcher
            .register_handler(msg_id::NODE_HEARTBEAT_RESP, || async { "node" })
            .expect("node");
        dispatcher
            .register_handler(msg_id::WORKER_HEARTBEAT_RESP, || async { "worker" })
            .expect("worker");

        let node = dispatcher
            .dispatch(msg_id::NODE_HEARTBEAT_RESP, Vec::new())
            .await
            .expect("node dispatch");
        let worker = dispatcher
            .dispatch(msg_id::WORKER_HEARTBEAT_RESP, Vec::new())
            .await
            .expect("worker dispatch");
        assert_eq!(&node[..], b"node");
        assert_eq!(&worker[..], b"worker");
    }

    #[tokio::test]
    async fn non_success_status_still_returns_body() {
        let dispatcher = Dispatcher::new(RouteTable::standard());
        dispatcher
            .register_handler(msg_id::TEST_STEP_UPDATE_RESP, || async {
                (StatusCode::BAD_REQUEST, "bad step")
            })
            .expect("register");

        let body = dispatcher
            .dispatch(msg_id::TEST_STEP_UPDATE_RESP, b"{}".to_vec())
            .await
            .expect("dispatch");
        assert_eq!(&body[..], b"bad step");
    }

    #[tokio::test]
    async fn handler_is_testable_with_request_for() {
        let app = Router::new().route(
            "/heartbeat",
            post(|body: Bytes| async move { format!("{} bytes", body.len()) }),
        );
        let request = request_for("/heartbeat", b"{\"node\":1}".to_vec()).expect("request");
        assert_eq!(
            request.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"application/json"[..])
        );

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), MAX_RESPONSE_LEN)
            .await
            .expect("body");
        assert_eq!(&body[..], b"10 bytes");
    }

    #[tokio::test]
    async fn deliver_discards_response_and_errors() {
        let dispatcher = Arc::new(Dispatcher::new(RouteTable::standard()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .register_handler(msg_id::NODE_HEARTBEAT_RESP, recording_handler(tx))
            .expect("register");

        let sink: Arc<dyn InboundSink> = dispatcher.clone();
        sink.deliver(msg_id::NODE_HEARTBEAT_RESP, b"hb".to_vec()).await;
        sink.deliver(777, b"dropped".to_vec()).await;

        let seen = rx.try_recv().expect("delivered");
        assert_eq!(&seen.body[..], b"hb");
        assert!(rx.try_recv().is_err());
    }
}
