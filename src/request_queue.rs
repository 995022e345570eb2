//! Per-host HTTP request queue.
//!
//! Hue bridges become sluggish or return garbage when hit with concurrent
//! requests. A [`RequestQueue`] allows only one outstanding request per
//! *category* while letting unrelated categories proceed in parallel, so a
//! pending light command never blocks a scene recall, but two light commands
//! never race each other on the wire.
//!
//! Requests in one category run strictly in submission order. A request that
//! fails or times out still releases its slot. Nothing is retried here;
//! retry policy belongs to the caller.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use log::{debug, trace};

use crate::callbacks::lock;
use crate::config::BridgeConfig;
use crate::errors::Error;
use crate::history::RequestHistory;
use crate::runtime;
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};

type Result<T> = std::result::Result<T, Error>;

/// Serializes requests to one host by category.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    host: Mutex<String>,
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
    default_content_type: String,
    // A category has an entry exactly while a worker is draining it.
    categories: Mutex<HashMap<String, VecDeque<Queued>>>,
    next_id: AtomicU64,
    history: Mutex<RequestHistory>,
}

struct Queued {
    id: u64,
    category: String,
    method: Method,
    path: String,
    body: Option<String>,
    content_type: String,
    timeout: Duration,
    completion: oneshot::Sender<Result<HttpResponse>>,
}

/// Completion of a queued request.
///
/// Resolves with the bridge's response (any status) or the failure that
/// prevented one.
#[must_use = "futures do nothing unless polled"]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Result<HttpResponse>>,
}

impl PendingResponse {
    /// Id assigned to the request when it was queued.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<HttpResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl RequestQueue {
    pub fn new(host: &str, transport: Arc<dyn Transport>, config: &BridgeConfig) -> Self {
        RequestQueue {
            inner: Arc::new(QueueInner {
                host: Mutex::new(host.to_string()),
                transport,
                default_timeout: config.request_timeout,
                default_content_type: config.content_type.clone(),
                categories: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                history: Mutex::new(RequestHistory::with_max_entries(config.history_size)),
            }),
        }
    }

    pub fn host(&self) -> String {
        lock(&self.inner.host).clone()
    }

    /// Point future requests at a new host. Requests already on the wire are
    /// unaffected.
    pub fn set_host(&self, host: &str) {
        *lock(&self.inner.host) = host.to_string();
    }

    /// Queue a GET request. The category defaults to the path.
    pub fn get(&self, path: &str, category: Option<&str>) -> PendingResponse {
        self.request(Method::Get, path, category, None, None, None)
    }

    /// Queue a POST request with the default content type.
    pub fn post(&self, path: &str, body: String, category: Option<&str>) -> PendingResponse {
        self.request(Method::Post, path, category, Some(body), None, None)
    }

    /// Queue a PUT request with the default content type.
    pub fn put(&self, path: &str, body: String, category: Option<&str>) -> PendingResponse {
        self.request(Method::Put, path, category, Some(body), None, None)
    }

    /// Queue a DELETE request.
    pub fn delete(&self, path: &str, category: Option<&str>) -> PendingResponse {
        self.request(Method::Delete, path, category, None, None, None)
    }

    /// Queue a request.
    ///
    /// The request is placed in its category's queue before this returns, so
    /// submission order is call order. `category` defaults to `path`,
    /// `content_type` and `timeout` to the queue's defaults.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        category: Option<&str>,
        body: Option<String>,
        content_type: Option<&str>,
        timeout: Option<Duration>,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let category = category.unwrap_or(path).to_string();

        let queued = Queued {
            id,
            category: category.clone(),
            method,
            path: path.to_string(),
            body,
            content_type: content_type
                .unwrap_or(&self.inner.default_content_type)
                .to_string(),
            timeout: timeout.unwrap_or(self.inner.default_timeout),
            completion: tx,
        };
        trace!("Request {id} queued: {method} {path} [{category}]");

        let start_worker = {
            let mut categories = lock(&self.inner.categories);
            match categories.get_mut(&category) {
                Some(queue) => {
                    queue.push_back(queued);
                    false
                }
                None => {
                    categories.insert(category.clone(), VecDeque::from([queued]));
                    true
                }
            }
        };

        if start_worker {
            let inner = Arc::clone(&self.inner);
            runtime::spawn(async move { inner.drain(category).await }).detach();
        }

        PendingResponse { id, rx }
    }

    /// Number of requests in `category` that have not been sent yet.
    pub fn pending(&self, category: &str) -> usize {
        lock(&self.inner.categories)
            .get(category)
            .map_or(0, VecDeque::len)
    }

    /// A copy of the request history.
    pub fn history(&self) -> RequestHistory {
        lock(&self.inner.history).clone()
    }
}

impl QueueInner {
    async fn drain(&self, category: String) {
        loop {
            let next = {
                let mut categories = lock(&self.categories);
                let Some(queue) = categories.get_mut(&category) else {
                    return;
                };
                match queue.pop_front() {
                    Some(next) => next,
                    None => {
                        categories.remove(&category);
                        return;
                    }
                }
            };

            let result = self.dispatch(&next).await;
            if next.completion.send(result).is_err() {
                trace!("Request {} completed with nobody waiting", next.id);
            }
        }
    }

    async fn dispatch(&self, queued: &Queued) -> Result<HttpResponse> {
        let request = HttpRequest {
            method: queued.method,
            host: lock(&self.host).clone(),
            path: queued.path.clone(),
            body: queued.body.clone(),
            content_type: queued.content_type.clone(),
            timeout: queued.timeout,
        };
        trace!("Request {} started: {} {}", queued.id, request.method, request.url());

        let send = AssertUnwindSafe(self.transport.send(&request)).catch_unwind();
        let result = match runtime::timeout(queued.timeout, send).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("transport panicked".into())),
            Err(_) => Err(Error::Timeout),
        };

        let mut history = lock(&self.history);
        match &result {
            Ok(response) => {
                trace!("Request {} finished with status {}", queued.id, response.status);
                history.record_response(
                    queued.id,
                    &queued.category,
                    queued.method,
                    &queued.path,
                    response.status,
                );
            }
            Err(e) => {
                debug!("Request {} to {} failed: {e}", queued.id, request.url());
                history.record_failure(
                    queued.id,
                    &queued.category,
                    queued.method,
                    &queued.path,
                    &e.to_string(),
                );
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runtime::BoxFuture;

    /// Records every request and answers after an optional per-path delay.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub sent: Mutex<Vec<HttpRequest>>,
        in_flight: Mutex<usize>,
        pub max_in_flight: Mutex<usize>,
        delays: Mutex<HashMap<String, Duration>>,
        responses: Mutex<HashMap<String, HttpResponse>>,
    }

    impl MockTransport {
        pub(crate) fn delay(&self, path: &str, delay: Duration) {
            lock(&self.delays).insert(path.to_string(), delay);
        }

        pub(crate) fn respond(&self, path: &str, status: u16, body: &str) {
            lock(&self.responses).insert(path.to_string(), HttpResponse::new(status, body));
        }

        /// Like [`MockTransport::respond`], but only for requests to `host`.
        pub(crate) fn respond_at(&self, host: &str, path: &str, status: u16, body: &str) {
            lock(&self.responses).insert(format!("{host}{path}"), HttpResponse::new(status, body));
        }

        pub(crate) fn paths(&self) -> Vec<String> {
            lock(&self.sent).iter().map(|r| r.path.clone()).collect()
        }

        pub(crate) fn count(&self, method: Method, path: &str) -> usize {
            lock(&self.sent)
                .iter()
                .filter(|r| r.method == method && r.path == path)
                .count()
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(&'a self, request: &'a HttpRequest) -> BoxFuture<'a, Result<HttpResponse>> {
            Box::pin(async move {
                lock(&self.sent).push(request.clone());
                {
                    let mut in_flight = lock(&self.in_flight);
                    *in_flight += 1;
                    let mut max = lock(&self.max_in_flight);
                    *max = (*max).max(*in_flight);
                }

                let delay = lock(&self.delays).get(&request.path).copied();
                if let Some(delay) = delay {
                    runtime::sleep(delay).await;
                }
                *lock(&self.in_flight) -= 1;

                let responses = lock(&self.responses);
                Ok(responses
                    .get(&format!("{}{}", request.host, request.path))
                    .or_else(|| responses.get(&request.path))
                    .cloned()
                    .unwrap_or_else(|| HttpResponse::new(200, "[]")))
            })
        }
    }

    fn queue(transport: &Arc<MockTransport>) -> RequestQueue {
        let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
        RequestQueue::new("10.0.0.2", transport, &BridgeConfig::default())
    }

    #[tokio::test]
    async fn test_same_category_is_serialized_in_order() {
        let transport = Arc::new(MockTransport::default());
        for i in 0..5 {
            transport.delay(&format!("/lights/{i}"), Duration::from_millis(10));
        }
        let queue = queue(&transport);

        let pending: Vec<_> = (0..5)
            .map(|i| queue.put(&format!("/lights/{i}"), "{}".into(), Some("lights")))
            .collect();
        assert_eq!(queue.pending("lights"), 5);

        for p in pending {
            assert!(p.await.is_ok());
        }

        assert_eq!(
            transport.paths(),
            vec!["/lights/0", "/lights/1", "/lights/2", "/lights/3", "/lights/4"]
        );
        assert_eq!(*lock(&transport.max_in_flight), 1);
        assert_eq!(queue.pending("lights"), 0);
    }

    #[tokio::test]
    async fn test_slow_category_does_not_block_another() {
        let transport = Arc::new(MockTransport::default());
        transport.delay("/lights/1/state", Duration::from_secs(5));
        let queue = queue(&transport);

        let _slow = queue.put("/lights/1/state", "{}".into(), Some("lights"));
        let fast = queue.put("/groups/0/action", "{}".into(), Some("groups"));

        let result = runtime::timeout(Duration::from_millis(500), fast).await;
        assert!(matches!(result, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_timeout_releases_category() {
        let transport = Arc::new(MockTransport::default());
        transport.delay("/hang", Duration::from_secs(5));
        transport.respond("/next", 200, r#"{"ok":true}"#);
        let queue = queue(&transport);

        let hung = queue.request(
            Method::Get,
            "/hang",
            Some("info"),
            None,
            None,
            Some(Duration::from_millis(50)),
        );
        let next = queue.get("/next", Some("info"));

        assert_eq!(hung.await.unwrap_err(), Error::Timeout);
        assert_eq!(next.await.unwrap().body, r#"{"ok":true}"#);

        let summary = queue.history().summary();
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.response_count, 1);
    }

    #[tokio::test]
    async fn test_category_defaults_to_path() {
        let transport = Arc::new(MockTransport::default());
        transport.delay("/a", Duration::from_millis(50));
        let queue = queue(&transport);

        let first = queue.get("/a", None);
        let second = queue.get("/a", None);
        assert_eq!(queue.pending("/a"), 2);
        assert!(second.id() > first.id());

        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn test_host_change_applies_to_new_requests() {
        let transport = Arc::new(MockTransport::default());
        let queue = queue(&transport);

        queue.get("/description.xml", Some("info")).await.unwrap();
        queue.set_host("10.0.0.9");
        queue.get("/description.xml", Some("info")).await.unwrap();

        let hosts: Vec<String> = lock(&transport.sent).iter().map(|r| r.host.clone()).collect();
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.9"]);
    }
}
