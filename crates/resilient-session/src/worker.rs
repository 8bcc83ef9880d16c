//! Worker side of the session: runs inside the child process.
//!
//! The worker receives its configuration through bootstrap environment
//! variables, talks to the supervisor over stdin/stdout, invokes the host's
//! work entry point once, and polls the service's health route.
//!
//! Exit paths:
//! - Crash: poll exhaustion, a failed or panicking work entry point, any
//!   uncaught panic, or a fatal error reported by the host. Reports
//!   `crash_detected`, runs exit handlers, exits 1.
//! - Graceful: a `manual_exit` from the supervisor, or the supervisor's end
//!   of the channel closing (treated as the session ending). Runs exit
//!   handlers, exits 0.
//!
//! The first exit path to start wins; later triggers are ignored.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::agent::{Role, Singleton};
use crate::bridge::{
    ChannelError, Correlator, CorrelatorConfig, ErrorLike, HandlerMap, Message, Reply,
};
use crate::config::{SERVER_PORT, SessionConfig};
use crate::error::SessionError;
use crate::fd_redirect::take_channel_fds;
use crate::health::{Health, HealthTracker, PollVerdict};
use crate::key::SessionKey;

pub const POLLING_ROUTE_ENV: &str = "SESSION_POLLING_ROUTE";
pub const POLLING_INTERVAL_ENV: &str = "SESSION_POLLING_INTERVAL_SECONDS";
pub const FAILURE_TOLERANCE_ENV: &str = "SESSION_POLLING_FAILURE_TOLERANCE";
pub const SERVER_PORT_ENV: &str = "SESSION_SERVER_PORT";
pub const SESSION_KEY_ENV: &str = "SESSION_KEY";
/// Prefix for every named port other than `server`.
pub const PORT_ENV_PREFIX: &str = "SESSION_PORT_";

const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";

static WORKER: Singleton = Singleton::new("worker agent");

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: String, value: String },
}

/// Everything a worker learns from its supervisor at spawn time.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerBootstrap {
    pub polling_route: String,
    pub polling_interval: Duration,
    pub failure_tolerance: u32,
    pub server_port: u16,
    /// All named ports, `server` included.
    pub ports: BTreeMap<String, u16>,
    pub session_key: SessionKey,
}

impl WorkerBootstrap {
    pub fn from_config(config: &SessionConfig, session_key: &SessionKey) -> Self {
        Self {
            polling_route: config.polling.route.clone(),
            polling_interval: Duration::from_secs(config.polling.interval_seconds),
            failure_tolerance: config.polling.failure_tolerance,
            server_port: config.server_port(),
            ports: config.ports.clone(),
            session_key: session_key.clone(),
        }
    }

    /// Environment variables handed to the child process.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (POLLING_ROUTE_ENV.to_string(), self.polling_route.clone()),
            (
                POLLING_INTERVAL_ENV.to_string(),
                self.polling_interval.as_secs().to_string(),
            ),
            (
                FAILURE_TOLERANCE_ENV.to_string(),
                self.failure_tolerance.to_string(),
            ),
            (SERVER_PORT_ENV.to_string(), self.server_port.to_string()),
            (SESSION_KEY_ENV.to_string(), self.session_key.to_string()),
        ];
        env.extend(
            self.ports
                .iter()
                .filter(|(name, _)| name.as_str() != SERVER_PORT)
                .map(|(name, port)| {
                    (
                        format!("{PORT_ENV_PREFIX}{}", name.to_uppercase()),
                        port.to_string(),
                    )
                }),
        );
        env
    }

    pub fn from_env() -> Result<Self, BootstrapError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, BootstrapError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let get = |name: &'static str| vars.get(name).ok_or(BootstrapError::Missing(name));

        let polling_route = get(POLLING_ROUTE_ENV)?.clone();
        let interval_seconds: u64 = parse_var(POLLING_INTERVAL_ENV, get(POLLING_INTERVAL_ENV)?)?;
        let failure_tolerance = parse_var(FAILURE_TOLERANCE_ENV, get(FAILURE_TOLERANCE_ENV)?)?;
        let server_port = parse_var(SERVER_PORT_ENV, get(SERVER_PORT_ENV)?)?;
        let session_key = SessionKey::from(get(SESSION_KEY_ENV)?.as_str());

        if interval_seconds == 0 {
            return Err(BootstrapError::Invalid {
                name: POLLING_INTERVAL_ENV.to_string(),
                value: "0".to_string(),
            });
        }

        let mut ports = BTreeMap::from([(SERVER_PORT.to_string(), server_port)]);
        for (name, value) in &vars {
            if let Some(port_name) = name.strip_prefix(PORT_ENV_PREFIX) {
                ports.insert(port_name.to_lowercase(), parse_var(name, value)?);
            }
        }

        Ok(Self {
            polling_route,
            polling_interval: Duration::from_secs(interval_seconds),
            failure_tolerance,
            server_port,
            ports,
            session_key,
        })
    }

    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }

    pub fn poll_target(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.server_port, self.polling_route)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, BootstrapError> {
    value.trim().parse().map_err(|_| BootstrapError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Why the worker is going down, as seen by exit handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    Crash(ErrorLike),
    Planned { is_session_end: bool },
}

impl ExitReason {
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crash(_))
    }
}

pub type ExitHandler = Arc<dyn Fn(ExitReason) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn boxed_exit_handler<F, Fut>(handler: F) -> ExitHandler
where
    F: Fn(ExitReason) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |reason| handler(reason).boxed())
}

/// Run exit handlers in registration order, each to completion. A panicking
/// handler is logged and the rest still run.
pub(crate) async fn run_exit_handlers(handlers: Vec<ExitHandler>, reason: ExitReason) {
    tracing::debug!(count = handlers.len(), crash = reason.is_crash(), "Running exit handlers");
    for handler in handlers {
        if let Err(panic) = AssertUnwindSafe(handler(reason.clone())).catch_unwind().await {
            let error = ErrorLike::from_panic(panic.as_ref());
            tracing::error!(%error, "Exit handler panicked");
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Bound on correlated calls to the supervisor. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Bound on a single health probe.
    pub probe_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(crate::bridge::correlator::DEFAULT_REQUEST_TIMEOUT),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("unhealthy status {0}")]
    Status(reqwest::StatusCode),
}

struct WorkerInner {
    bootstrap: WorkerBootstrap,
    channel: Arc<Correlator>,
    handlers: HandlerMap,
    tracker: StdMutex<HealthTracker>,
    interval_ms: AtomicU64,
    exit_handlers: StdMutex<Vec<ExitHandler>>,
    exiting: AtomicBool,
    work_started: AtomicBool,
    polling: CancellationToken,
    crash_tx: mpsc::UnboundedSender<ErrorLike>,
    exit_tx: watch::Sender<Option<i32>>,
    probe: reqwest::Client,
}

impl WorkerInner {
    fn tracker(&self) -> std::sync::MutexGuard<'_, HealthTracker> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    fn lifecycle(&self, event: impl Into<String>) {
        let event = event.into();
        tracing::debug!(%event, "Lifecycle");
        if let Err(e) = self.channel.notify(Message::Lifecycle { event }) {
            tracing::debug!(error = %e, "Lifecycle notification not sent");
        }
    }

    fn exit_handlers(&self) -> Vec<ExitHandler> {
        self.exit_handlers
            .lock()
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }

    fn finish(&self, code: i32) {
        tracing::info!(code, "Worker exiting");
        self.exit_tx.send_replace(Some(code));
    }

    async fn proactive_unplanned_exit(&self, error: ErrorLike) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            tracing::debug!(%error, "Exit already in progress");
            return;
        }
        tracing::error!(%error, "Unplanned exit");

        self.tracker().mark_unresponsive();
        self.polling.cancel();

        if let Err(e) = self.channel.notify(Message::CrashDetected {
            error: error.clone(),
        }) {
            tracing::warn!(error = %e, "Could not report crash to supervisor");
        }
        run_exit_handlers(self.exit_handlers(), ExitReason::Crash(error.clone())).await;

        self.lifecycle(format!(
            "crash event detected @ {}",
            chrono::Utc::now().to_rfc2822()
        ));
        self.lifecycle(error.message.clone());

        self.channel.destroy();
        self.channel.close().await;
        self.finish(1);
    }

    async fn graceful_exit(&self, is_session_end: bool) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Exit already in progress");
            return;
        }
        tracing::info!(is_session_end, "Planned exit");

        self.polling.cancel();
        self.channel.destroy();
        run_exit_handlers(self.exit_handlers(), ExitReason::Planned { is_session_end }).await;
        self.channel.close().await;
        self.finish(0);
    }

    async fn supervisor_lost(&self) {
        tracing::warn!("Supervisor channel closed, ending session");
        self.graceful_exit(true).await;
    }

    fn register_internal_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.handlers.on(Message::MANUAL_EXIT, move |message| {
            let weak = Weak::clone(&weak);
            async move {
                if let (Message::ManualExit { is_session_end }, Some(inner)) =
                    (message, weak.upgrade())
                {
                    inner.graceful_exit(is_session_end).await;
                }
                Ok(Value::Null)
            }
        });

        let weak = Arc::downgrade(self);
        self.handlers.on(Message::UPDATE_POLLING_INTERVAL, move |message| {
            let weak = Weak::clone(&weak);
            async move {
                let Message::UpdatePollingInterval {
                    new_polling_interval_seconds: seconds,
                } = message
                else {
                    anyhow::bail!("unexpected message {}", message.name());
                };
                if seconds == 0 {
                    anyhow::bail!("the polling interval must be at least one second");
                }
                if let Some(inner) = weak.upgrade() {
                    inner
                        .interval_ms
                        .store(seconds.saturating_mul(1000), Ordering::SeqCst);
                    tracing::info!(seconds, "Polling interval updated");
                }
                Ok(json!(seconds))
            }
        });
    }
}

async fn probe(client: &reqwest::Client, target: &str) -> Result<(), ProbeError> {
    let response = client.get(target).send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ProbeError::Status(status))
    }
}

/// Sleep, probe, act on the verdict, repeat. Polls never overlap.
async fn poll_loop(inner: Arc<WorkerInner>) {
    let target = inner.bootstrap.poll_target();
    tracing::debug!(%target, "Health polling started");

    loop {
        tokio::select! {
            _ = inner.polling.cancelled() => break,
            _ = tokio::time::sleep(inner.interval()) => {}
        }

        let outcome = tokio::select! {
            _ = inner.polling.cancelled() => break,
            outcome = probe(&inner.probe, &target) => outcome,
        };

        let verdict = match &outcome {
            Ok(()) => inner.tracker().record_success(),
            Err(_) => inner.tracker().record_failure(),
        };

        match verdict {
            PollVerdict::BecameHealthy { is_first_time } => {
                tracing::info!(port = inner.bootstrap.server_port, is_first_time, "Service is responding");
                inner.lifecycle(format!("listening on {}...", inner.bootstrap.server_port));
                if let Err(e) = inner.channel.notify(Message::ServerRunning { is_first_time }) {
                    tracing::warn!(error = %e, "Could not report server_running");
                }
            }
            PollVerdict::StillHealthy => tracing::trace!("Health check passed"),
            PollVerdict::Ignored => {
                tracing::debug!("Service not responding yet");
            }
            PollVerdict::Tolerated {
                failures,
                tolerance,
            } => {
                tracing::warn!(failures, tolerance, "Health check failed");
                inner.lifecycle(format!(
                    "the server has encountered {failures} of {tolerance} tolerable failures"
                ));
            }
            PollVerdict::Exhausted { failures } => {
                let reason = match outcome {
                    Err(e) => e.to_string(),
                    Ok(()) => "unknown".to_string(),
                };
                let error = ErrorLike::new(
                    HEALTH_CHECK_FAILED,
                    format!("{target} failed {failures} consecutive health checks: {reason}"),
                );
                let _ = inner.crash_tx.send(error);
                break;
            }
        }
    }
    tracing::debug!("Health polling stopped");
}

/// The worker agent. One per worker process.
pub struct WorkerAgent {
    inner: Arc<WorkerInner>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl WorkerAgent {
    /// Create the process's worker agent over stdin/stdout, configured from
    /// the bootstrap environment. Fails in the supervisor role and on a
    /// second call.
    pub fn create(role: Role, options: WorkerOptions) -> Result<Self, SessionError> {
        if role != Role::Worker {
            return Err(SessionError::misuse(
                "cannot create a worker on the monitor process",
            ));
        }
        WORKER.claim()?;

        let bootstrap = WorkerBootstrap::from_env()?;
        let io = take_channel_fds()?;
        let agent = Self::start(bootstrap, io.reader, io.writer, options)?;
        agent.install_panic_hook();
        Ok(agent)
    }

    /// Attach a worker to an arbitrary channel. Does not claim the process
    /// singleton or install the panic hook.
    pub fn start<R, W>(
        bootstrap: WorkerBootstrap,
        reader: R,
        writer: W,
        options: WorkerOptions,
    ) -> Result<Self, SessionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let probe = reqwest::Client::builder()
            .timeout(options.probe_timeout)
            .build()?;

        let handlers = HandlerMap::new();
        let channel = Correlator::spawn(
            reader,
            writer,
            Arc::new(handlers.clone()),
            CorrelatorConfig::new("worker").with_request_timeout(options.request_timeout),
        );

        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let interval_ms = u64::try_from(bootstrap.polling_interval.as_millis()).unwrap_or(u64::MAX);

        let inner = Arc::new(WorkerInner {
            tracker: StdMutex::new(HealthTracker::new(bootstrap.failure_tolerance)),
            interval_ms: AtomicU64::new(interval_ms),
            bootstrap,
            channel,
            handlers,
            exit_handlers: StdMutex::new(Vec::new()),
            exiting: AtomicBool::new(false),
            work_started: AtomicBool::new(false),
            polling: CancellationToken::new(),
            crash_tx,
            exit_tx,
            probe,
        });
        inner.register_internal_handlers();

        let for_crashes = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(error) = crash_rx.recv().await {
                let Some(inner) = for_crashes.upgrade() else {
                    break;
                };
                inner.proactive_unplanned_exit(error).await;
            }
        });

        let for_parent = Arc::downgrade(&inner);
        let channel = Arc::clone(&inner.channel);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(inner) = for_parent.upgrade() {
                inner.supervisor_lost().await;
            }
        });

        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        inner.lifecycle(format!("initializing process... [{exe}]"));

        Ok(Self { inner, exit_rx })
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Invoke the host work entry point (once) and start health polling.
    /// An error or panic from `work` is a crash.
    pub fn launch_work<F, Fut>(&self, work: F) -> Result<(), SessionError>
    where
        F: FnOnce(WorkerHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.work_started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::misuse(
                "the work entry point can only be invoked once",
            ));
        }

        let work = work(self.handle());
        let crash_tx = self.inner.crash_tx.clone();
        tokio::spawn(async move {
            match tokio::spawn(work).await {
                Ok(Ok(())) => tracing::debug!("Work entry point returned"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Work entry point failed");
                    let _ = crash_tx.send(ErrorLike::from_anyhow(&e));
                }
                Err(join) if join.is_panic() => {
                    let _ = crash_tx.send(ErrorLike::from_panic(join.into_panic().as_ref()));
                }
                Err(_) => tracing::debug!("Work entry point cancelled"),
            }
        });

        tokio::spawn(poll_loop(Arc::clone(&self.inner)));
        Ok(())
    }

    /// Resolves with the exit code once an exit path has finished.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut exit_rx = self.exit_rx.clone();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(1),
            Err(_) => 1,
        }
    }

    /// Route panics that escape everything else into the crash path.
    /// Panics inside inbound handlers are answered by the correlator and
    /// left alone.
    fn install_panic_hook(&self) {
        let crash_tx = self.inner.crash_tx.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            forward_panic(&crash_tx, info.payload(), info.to_string());
        }));
    }
}

/// Hand a panic to the crash path unless an inbound handler is being polled
/// on this thread. Returns whether it was forwarded.
fn forward_panic(
    crash_tx: &mpsc::UnboundedSender<ErrorLike>,
    payload: &(dyn Any + Send),
    detail: String,
) -> bool {
    if crate::bridge::correlator::panic_is_contained() {
        return false;
    }
    let error = ErrorLike::from_panic(payload).with_stack(detail);
    crash_tx.send(error).is_ok()
}

/// Worker API handed to the host.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    pub fn bootstrap(&self) -> &WorkerBootstrap {
        &self.inner.bootstrap
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.inner.bootstrap.session_key
    }

    pub fn server_port(&self) -> u16 {
        self.inner.bootstrap.server_port
    }

    pub fn health(&self) -> Health {
        self.inner.tracker().health()
    }

    pub fn polling_interval(&self) -> Duration {
        self.inner.interval()
    }

    /// Called, in registration order, before the process exits.
    pub fn add_exit_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(ExitReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handlers = self
            .inner
            .exit_handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.push(boxed_exit_handler(handler));
    }

    /// Echo an event on the supervisor's console.
    pub fn lifecycle(&self, event: impl Into<String>) {
        self.inner.lifecycle(event);
    }

    /// Ask the supervisor to end the whole session. This worker is stopped
    /// along with it.
    pub fn kill_session(
        &self,
        reason: impl Into<String>,
        graceful: bool,
        error_code: i32,
    ) -> Result<(), ChannelError> {
        self.inner.channel.notify(Message::Kill {
            reason: reason.into(),
            graceful,
            error_code,
        })
    }

    pub fn send_action(&self, action: impl Into<String>, args: Value) -> Result<(), ChannelError> {
        self.inner.channel.notify(Message::action(action, args))
    }

    pub async fn request_action(&self, action: impl Into<String>, args: Value) -> Reply {
        self.inner.channel.request(Message::action(action, args)).await
    }

    /// Handle a host-defined action sent by the supervisor.
    pub fn on_action<F, Fut>(&self, action: &str, handler: F) -> Result<(), SessionError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if Message::NAMES.contains(&action) {
            return Err(SessionError::misuse(format!(
                "'{action}' is a reserved message name"
            )));
        }
        let handler = Arc::new(handler);
        self.inner.handlers.on(action, move |message| {
            let handler = Arc::clone(&handler);
            async move {
                match message {
                    Message::Action { args, .. } => handler(args).await,
                    other => anyhow::bail!("unexpected message {}", other.name()),
                }
            }
        });
        Ok(())
    }

    /// Treat `error` as fatal: report it and exit 1.
    pub fn report_fatal(&self, error: &anyhow::Error) {
        let _ = self.inner.crash_tx.send(ErrorLike::from_anyhow(error));
    }
}
