//! Request/response correlation over a one-way duplex channel.
//!
//! Both processes run one `Correlator` over their end of the channel. It
//! offers fire-and-forget [`Correlator::notify`], correlated
//! [`Correlator::request`], and routes inbound requests to a [`Router`],
//! answering each with a [`Reply`] that carries the request's id.
//!
//! Settlement rules:
//! - A local call is settled by whoever removes its waiter first: the
//!   matching response, the timeout, `destroy()` or channel close.
//! - An inbound request is answered by whoever removes its pending entry
//!   first: the handler on completion, or `destroy()` with a
//!   `ManagerDestroyed` error.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, try_join_all};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::protocol::{Envelope, ErrorLike, Message, Reply};

/// Default bound on how long a correlated call waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot use a destroyed IPC manager to emit a message")]
    Destroyed,
    #[error("the channel is closed; the message could not be sent")]
    Closed,
}

impl From<ChannelError> for ErrorLike {
    fn from(err: ChannelError) -> Self {
        ErrorLike::failed_dispatch(err.to_string())
    }
}

thread_local! {
    static CONTAINED: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is polling an inbound handler. A panic hook
/// uses this to tell handler panics (caught and replied) from process-fatal
/// ones.
pub fn panic_is_contained() -> bool {
    CONTAINED.with(Cell::get)
}

struct ContainedGuard(bool);

impl Drop for ContainedGuard {
    fn drop(&mut self) {
        CONTAINED.with(|c| c.set(self.0));
    }
}

/// Marks every poll of the wrapped handler future as contained.
struct Contained<'a, T>(BoxFuture<'a, T>);

impl<T> Future for Contained<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let _guard = ContainedGuard(CONTAINED.with(|c| c.replace(true)));
        self.0.as_mut().poll(cx)
    }
}

/// Handles inbound, non-response messages.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn route(&self, message: Message) -> anyhow::Result<Vec<Value>>;
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Name-keyed handler lists. Every handler registered for a key runs; their
/// results come back in registration order.
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: Arc<StdRwLock<HashMap<String, Vec<Handler>>>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(&self, key: impl Into<String>, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message| handler(message).boxed());
        let mut map = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key.into()).or_default().push(handler);
    }

    pub fn handles(&self, key: &str) -> bool {
        self.handlers
            .read()
            .map(|map| map.get(key).is_some_and(|list| !list.is_empty()))
            .unwrap_or(false)
    }

    fn handlers_for(&self, key: &str) -> Vec<Handler> {
        self.handlers
            .read()
            .map(|map| map.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Router for HandlerMap {
    async fn route(&self, message: Message) -> anyhow::Result<Vec<Value>> {
        let handlers = self.handlers_for(message.route_key());
        if handlers.is_empty() {
            tracing::debug!(key = message.route_key(), "No handler registered");
            return Ok(Vec::new());
        }
        try_join_all(handlers.iter().map(|handler| handler(message.clone()))).await
    }
}

/// Adapts a single async closure into a [`Router`].
pub struct FnRouter<F>(F);

pub fn router_fn<F, Fut>(f: F) -> FnRouter<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnRouter(f)
}

#[async_trait]
impl<F, Fut> Router for FnRouter<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn route(&self, message: Message) -> anyhow::Result<Vec<Value>> {
        Ok(vec![(self.0)(message).await?])
    }
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Name used in log lines ("monitor" or "worker").
    pub label: String,
    /// `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl CorrelatorConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

pub struct Correlator {
    label: String,
    request_timeout: Option<Duration>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
    /// Our own outstanding calls: id -> one-shot listener.
    waiters: StdMutex<HashMap<String, oneshot::Sender<Reply>>>,
    /// Inbound requests whose handler is running: id -> message name.
    pending: StdMutex<HashMap<String, String>>,
    destroyed: AtomicBool,
    /// Cancelled once the read side reaches EOF or fails.
    closed: CancellationToken,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Correlator {
    /// Attach to a channel. Spawns one writer task and one reader task; the
    /// reader routes inbound requests through `router`.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        router: Arc<dyn Router>,
        config: CorrelatorConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, rx, config.label.clone()));

        let this = Arc::new(Self {
            label: config.label,
            request_timeout: config.request_timeout,
            outbound: StdMutex::new(Some(tx)),
            waiters: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            writer_task: StdMutex::new(Some(writer_task)),
        });

        let for_reader = Arc::clone(&this);
        tokio::spawn(async move {
            for_reader.read_frames(reader, router).await;
        });

        this
    }

    /// Fire-and-forget.
    pub fn notify(&self, message: Message) -> Result<(), ChannelError> {
        if self.is_destroyed() {
            return Err(ChannelError::Destroyed);
        }
        tracing::trace!(label = %self.label, name = message.name(), "Sending notify");
        self.send_envelope(Envelope::notify(&message))
    }

    /// Send a request and wait for the correlated reply. Never fails with a
    /// Rust error: dispatch problems, destruction and timeouts all settle as
    /// a `Reply` carrying an [`ErrorLike`].
    pub async fn request(&self, message: Message) -> Reply {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut waiters = lock(&self.waiters);
            if self.is_destroyed() {
                return Reply::failure(ChannelError::Destroyed.into());
            }
            waiters.insert(id.clone(), tx);
        }

        tracing::trace!(label = %self.label, name = message.name(), %id, "Sending request");
        if let Err(e) = self.send_envelope(Envelope::request(&message, &id)) {
            lock(&self.waiters).remove(&id);
            return Reply::failure(e.into());
        }

        let settled = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    lock(&self.waiters).remove(&id);
                    tracing::warn!(label = %self.label, name = message.name(), %id, "Request timed out");
                    return Reply::failure(ErrorLike::timed_out(limit));
                }
            },
            None => rx.await,
        };

        settled.unwrap_or_else(|_| Reply::failure(ErrorLike::manager_destroyed()))
    }

    /// `emit(name, args, awaitResponse)`: a notify when `await_response` is
    /// false (settles immediately with empty results), a request otherwise.
    pub async fn emit(&self, message: Message, await_response: bool) -> Reply {
        if await_response {
            return self.request(message).await;
        }
        match self.notify(message) {
            Ok(()) => Reply::success(Vec::new()),
            Err(e) => Reply::failure(e.into()),
        }
    }

    /// Refuse further emits, answer every in-flight inbound request with a
    /// `ManagerDestroyed` error, and settle our own outstanding calls the same
    /// way.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(String, String)> = lock(&self.pending).drain().collect();
        tracing::debug!(label = %self.label, pending = drained.len(), "Destroying IPC manager");
        let reply = Reply::failure(ErrorLike::manager_destroyed());
        for (id, name) in drained {
            if let Err(e) = self.send_envelope(Envelope::response(name, id, &reply)) {
                tracing::debug!(label = %self.label, error = %e, "Could not deliver destroy reply");
            }
        }
        self.settle_waiters(ErrorLike::manager_destroyed());
    }

    /// Stop accepting outbound frames and wait for the queued ones to be
    /// written.
    pub async fn close(&self) {
        lock(&self.outbound).take();
        let task = lock(&self.writer_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Resolves once the peer has gone away: its end of the channel closed
    /// or a frame could not be read.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Inbound requests still being handled.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Local calls still waiting for a reply.
    pub fn outstanding_count(&self) -> usize {
        lock(&self.waiters).len()
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<(), ChannelError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    fn settle_waiters(&self, error: ErrorLike) {
        let drained: Vec<oneshot::Sender<Reply>> =
            lock(&self.waiters).drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Reply::failure(error.clone()));
        }
    }

    async fn read_frames<R>(self: Arc<Self>, reader: R, router: Arc<dyn Router>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(reader, JsonCodec::<Envelope>::new());
        loop {
            match frames.next().await {
                Some(Ok(envelope)) => self.handle_inbound(envelope, &router),
                Some(Err(e)) => {
                    tracing::warn!(label = %self.label, error = %e, "Channel read error");
                    break;
                }
                None => {
                    tracing::debug!(label = %self.label, "Channel closed by peer");
                    break;
                }
            }
        }

        self.destroyed.store(true, Ordering::SeqCst);
        lock(&self.pending).clear();
        self.settle_waiters(ErrorLike::new(
            ErrorLike::MANAGER_DESTROYED,
            "The channel closed before the response could be returned.",
        ));
        self.closed.cancel();
    }

    fn handle_inbound(self: &Arc<Self>, envelope: Envelope, router: &Arc<dyn Router>) {
        if envelope.is_response() {
            let Some(id) = envelope.id() else {
                return;
            };
            match lock(&self.waiters).remove(id) {
                Some(tx) => {
                    let _ = tx.send(envelope.reply());
                }
                None => {
                    tracing::debug!(label = %self.label, %id, name = %envelope.name, "Response with no waiter");
                }
            }
            return;
        }

        let id = envelope.id().map(str::to_string);
        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(label = %self.label, name = %envelope.name, error = %e, "Rejecting invalid message");
                if let Some(id) = id {
                    let reply = Reply::failure(ErrorLike::new(
                        ErrorLike::INVALID_MESSAGE,
                        format!("invalid '{}' message: {}", envelope.name, e),
                    ));
                    let _ = self.send_envelope(Envelope::response(envelope.name, id, &reply));
                }
                return;
            }
        };

        if let Some(ref id) = id {
            lock(&self.pending).insert(id.clone(), envelope.name.clone());
        }

        let this = Arc::clone(self);
        let router = Arc::clone(router);
        tokio::spawn(async move {
            let name = message.name();
            let outcome = AssertUnwindSafe(Contained(router.route(message)))
                .catch_unwind()
                .await;
            let reply = match outcome {
                Ok(Ok(results)) => Reply::success(results),
                Ok(Err(e)) => Reply::failure(ErrorLike::from_anyhow(&e)),
                Err(panic) => Reply::failure(ErrorLike::from_panic(panic.as_ref())),
            };

            match id {
                Some(id) => this.respond(&id, reply),
                None => {
                    if let Some(error) = reply.error {
                        tracing::warn!(label = %this.label, name, %error, "Notify handler failed");
                    }
                }
            }
        });
    }

    fn respond(&self, id: &str, reply: Reply) {
        let Some(name) = lock(&self.pending).remove(id) else {
            tracing::debug!(label = %self.label, %id, "Reply already settled");
            return;
        };
        if let Err(e) = self.send_envelope(Envelope::response(name, id, &reply)) {
            tracing::warn!(label = %self.label, %id, error = %e, "Failed to send reply");
        }
    }
}

async fn write_frames<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>, label: String)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut frames = FramedWrite::new(writer, JsonCodec::<Envelope>::new());
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = frames.send(envelope).await {
            tracing::warn!(%label, error = %e, "Channel write error");
            return;
        }
    }
    let _ = frames.close().await;
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Metadata;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::Notify;

    fn config(label: &str) -> CorrelatorConfig {
        CorrelatorConfig::new(label)
    }

    fn pair(
        left: Arc<dyn Router>,
        right: Arc<dyn Router>,
        left_config: CorrelatorConfig,
    ) -> (Arc<Correlator>, Arc<Correlator>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ra, wa) = tokio::io::split(a);
        let (rb, wb) = tokio::io::split(b);
        (
            Correlator::spawn(ra, wa, left, left_config),
            Correlator::spawn(rb, wb, right, config("right")),
        )
    }

    fn raw_end() -> (
        FramedRead<ReadHalf<DuplexStream>, JsonCodec<Envelope>>,
        FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Envelope>>,
        DuplexStream,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ra, wa) = tokio::io::split(a);
        (FramedRead::new(ra, JsonCodec::new()), FramedWrite::new(wa, JsonCodec::new()), b)
    }

    fn action(name: &str, args: Value) -> Message {
        Message::action(name, args)
    }

    async fn blow_up(_: Message) -> anyhow::Result<Value> {
        panic!("handler blew up")
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn request_settles_with_handler_result() {
        let handlers = HandlerMap::new();
        handlers.on("double", |message| async move {
            let Message::Action { args, .. } = message else {
                anyhow::bail!("unexpected message");
            };
            Ok(json!(args["n"].as_i64().unwrap_or(0) * 2))
        });

        let (left, _right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let reply = left.request(action("double", json!({"n": 21}))).await;
        assert_eq!(reply.into_result().unwrap(), vec![json!(42)]);
        assert_eq!(left.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn handler_error_is_captured_not_thrown() {
        let handlers = HandlerMap::new();
        handlers.on("explode", |_| async { Err::<Value, _>(anyhow::anyhow!("boom")) });

        let (left, right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let reply = left.request(action("explode", Value::Null)).await;
        let error = reply.error.expect("error reply");
        assert_eq!(error.name, "Error");
        assert_eq!(error.message, "boom");
        assert!(error.stack.is_some());
        assert_eq!(right.pending_count(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_break_the_channel() {
        let handlers = HandlerMap::new();
        handlers.on("panic", blow_up);
        handlers.on("ping", |_| async { Ok(json!("pong")) });

        let (left, _right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let reply = left.request(action("panic", Value::Null)).await;
        let error = reply.error.expect("error reply");
        assert_eq!(error.name, ErrorLike::PANIC);
        assert_eq!(error.message, "handler blew up");

        let reply = left.request(action("ping", Value::Null)).await;
        assert_eq!(reply.into_result().unwrap(), vec![json!("pong")]);
        assert!(!panic_is_contained());
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently_of_arrival_order() {
        let handlers = HandlerMap::new();
        handlers.on("sleep", |message| async move {
            let Message::Action { args, .. } = message else {
                anyhow::bail!("unexpected message");
            };
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        });

        let (left, _right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let slow = left.request(action("sleep", json!({"ms": 80})));
        let fast = left.request(action("sleep", json!({"ms": 5})));
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.into_result().unwrap(), vec![json!(80)]);
        assert_eq!(fast.into_result().unwrap(), vec![json!(5)]);
    }

    #[tokio::test]
    async fn all_handlers_for_a_name_contribute_results() {
        let handlers = HandlerMap::new();
        handlers.on("multi", |_| async { Ok(json!(1)) });
        handlers.on("multi", |_| async { Ok(json!(2)) });

        let (left, _right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let reply = left.request(action("multi", Value::Null)).await;
        assert_eq!(reply.into_result().unwrap(), vec![json!(1), json!(2)]);

        let reply = left.request(action("nobody", Value::Null)).await;
        assert_eq!(reply.into_result().unwrap(), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn notify_reaches_router_without_reply() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handlers = HandlerMap::new();
        handlers.on(Message::LIFECYCLE, move |message| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(message);
                Ok(Value::Null)
            }
        });

        let (left, right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        left.notify(Message::Lifecycle {
            event: "booting".to_string(),
        })
        .unwrap();

        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(
            seen,
            Message::Lifecycle {
                event: "booting".to_string()
            }
        );
        assert_eq!(right.pending_count(), 0);
        assert_eq!(left.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn destroy_answers_pending_requests_exactly_once() {
        let release = Arc::new(Notify::new());
        let handlers = HandlerMap::new();
        let gate = Arc::clone(&release);
        handlers.on("hang", move |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(json!("late"))
            }
        });

        let (left, right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let call = {
            let left = Arc::clone(&left);
            tokio::spawn(async move { left.request(action("hang", Value::Null)).await })
        };

        wait_until(|| right.pending_count() == 1).await;
        right.destroy();

        let reply = call.await.unwrap();
        assert!(reply.error.unwrap().is(ErrorLike::MANAGER_DESTROYED));
        assert_eq!(right.pending_count(), 0);

        // The handler finishing afterwards must not produce a second reply.
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(left.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn destroy_settles_local_outstanding_calls() {
        let handlers = HandlerMap::new();
        handlers.on("hang", |_| std::future::pending::<anyhow::Result<Value>>());

        let (left, _right) = pair(Arc::new(HandlerMap::new()), Arc::new(handlers), config("left"));

        let call = {
            let left = Arc::clone(&left);
            tokio::spawn(async move { left.request(action("hang", Value::Null)).await })
        };
        wait_until(|| left.outstanding_count() == 1).await;
        left.destroy();

        let reply = call.await.unwrap();
        assert!(reply.error.unwrap().is(ErrorLike::MANAGER_DESTROYED));
    }

    #[tokio::test]
    async fn destroyed_correlator_fails_fast() {
        let (left, _right) = pair(
            Arc::new(HandlerMap::new()),
            Arc::new(HandlerMap::new()),
            config("left"),
        );
        left.destroy();

        let reply = left.request(action("anything", Value::Null)).await;
        assert!(reply.error.unwrap().is(ErrorLike::FAILED_DISPATCH));

        assert_eq!(
            left.notify(Message::Lifecycle {
                event: "x".to_string()
            }),
            Err(ChannelError::Destroyed)
        );

        let reply = left
            .emit(
                Message::Lifecycle {
                    event: "x".to_string(),
                },
                false,
            )
            .await;
        assert!(reply.error.unwrap().is(ErrorLike::FAILED_DISPATCH));
    }

    #[tokio::test]
    async fn request_times_out_when_no_reply_arrives() {
        let handlers = HandlerMap::new();
        handlers.on("hang", |_| std::future::pending::<anyhow::Result<Value>>());

        let (left, _right) = pair(
            Arc::new(HandlerMap::new()),
            Arc::new(handlers),
            config("left").with_request_timeout(Some(Duration::from_millis(50))),
        );

        let reply = left.request(action("hang", Value::Null)).await;
        assert!(reply.error.unwrap().is(ErrorLike::TIMED_OUT));
        assert_eq!(left.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_settles_outstanding_calls() {
        let (reader, writer, far_end) = raw_end();
        let (near_read, near_write) = tokio::io::split(far_end);
        let left = Correlator::spawn(
            near_read,
            near_write,
            Arc::new(HandlerMap::new()),
            config("left"),
        );

        let call = {
            let left = Arc::clone(&left);
            tokio::spawn(async move { left.request(action("hang", Value::Null)).await })
        };
        wait_until(|| left.outstanding_count() == 1).await;
        assert!(!left.is_closed());

        drop(reader);
        drop(writer);

        let reply = call.await.unwrap();
        assert!(reply.error.unwrap().is(ErrorLike::MANAGER_DESTROYED));
        assert!(left.is_destroyed());
        tokio::time::timeout(Duration::from_secs(1), left.closed())
            .await
            .expect("close signal not raised");
        assert!(left.is_closed());
    }

    #[tokio::test]
    async fn invalid_request_is_answered_with_error() {
        let (mut reader, mut writer, far_end) = raw_end();
        let (near_read, near_write) = tokio::io::split(far_end);
        let _correlator = Correlator::spawn(
            near_read,
            near_write,
            Arc::new(HandlerMap::new()),
            config("near"),
        );

        writer
            .send(Envelope {
                name: "reboot_universe".to_string(),
                args: json!({}),
                metadata: Some(Metadata::request("bad-1")),
            })
            .await
            .unwrap();

        let response = reader.next().await.unwrap().unwrap();
        assert!(response.is_response());
        assert_eq!(response.id(), Some("bad-1"));
        assert!(response.reply().error.unwrap().is(ErrorLike::INVALID_MESSAGE));
    }

    #[tokio::test]
    async fn single_closure_router() {
        let router = router_fn(|message: Message| async move { Ok(json!(message.route_key())) });
        let (left, _right) = pair(Arc::new(HandlerMap::new()), Arc::new(router), config("left"));

        let reply = left.emit(action("echo", Value::Null), true).await;
        assert_eq!(reply.into_result().unwrap(), vec![json!("echo")]);
    }

    #[tokio::test]
    async fn close_flushes_queued_frames() {
        let (mut reader, _writer, far_end) = raw_end();
        let (near_read, near_write) = tokio::io::split(far_end);
        let correlator = Correlator::spawn(
            near_read,
            near_write,
            Arc::new(HandlerMap::new()),
            config("near"),
        );

        for i in 0..10 {
            correlator
                .notify(Message::Lifecycle {
                    event: format!("event {i}"),
                })
                .unwrap();
        }
        correlator.close().await;

        for i in 0..10 {
            let envelope = reader.next().await.unwrap().unwrap();
            assert_eq!(envelope.args["event"], json!(format!("event {i}")));
        }
        assert_eq!(
            correlator.notify(Message::Lifecycle {
                event: "late".to_string()
            }),
            Err(ChannelError::Closed)
        );
    }
}
