//! Supervisor side of the session.
//!
//! The monitor owns the configuration, spawns exactly one worker at a time
//! and replaces it whenever it exits. Each worker is tagged with a
//! generation number; only the exit of the current generation triggers a
//! respawn, so a worker that was already replaced never spawns a second
//! successor.
//!
//! Operators drive the monitor through the console on stdin; workers drive
//! it through notifications routed by the listener registry.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::agent::{ROLE_ENV, Role, Singleton, WORKER_ROLE};
use crate::bridge::correlator::DEFAULT_REQUEST_TIMEOUT;
use crate::bridge::{Correlator, CorrelatorConfig, ErrorLike, HandlerMap, Message, Reply};
use crate::config::{self, ConfigSource, SessionConfig};
use crate::console::{ArgSpec, Args, Console, ConsoleConfig};
use crate::error::SessionError;
use crate::key::SessionKey;
use crate::worker::{
    ExitHandler, ExitReason, PORT_ENV_PREFIX, WorkerBootstrap, boxed_exit_handler,
    run_exit_handlers,
};

static MONITOR: Singleton = Singleton::new("monitor");

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn timestamp() -> colored::ColoredString {
    format!("[{}]", chrono::Utc::now().to_rfc2822()).blue()
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}")?,
            None => f.write_str("no code")?,
        }
        if let Some(signal) = self.signal {
            write!(f, ", having encountered signal {signal}")?;
        }
        Ok(())
    }
}

/// A running worker process as seen by the monitor.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    async fn wait(&mut self) -> io::Result<ExitInfo>;

    /// Forceful kill. The worker's own cleanup does not run.
    fn terminate(&mut self) -> io::Result<()>;
}

pub struct ChildProcess(Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        self.0.wait().await.map(ExitInfo::from)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.0.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(io::Error::other)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }
}

/// What a spawner needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub bootstrap: WorkerBootstrap,
    /// Inherit the worker's stderr instead of discarding it.
    pub show_output: bool,
}

/// A freshly started worker: its process plus the monitor's ends of the
/// channel.
pub struct SpawnedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedWorker>;
}

/// Re-runs the current executable with the worker role and bootstrap
/// environment. The child's stdin/stdout carry the channel.
pub struct SelfSpawner;

impl WorkerSpawner for SelfSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedWorker> {
        let exe = std::env::current_exe()?;
        let stderr = if request.show_output {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let mut command = Command::new(exe);
        command.args(std::env::args_os().skip(1));
        for name in inherited_port_vars(std::env::vars_os().map(|(name, _)| name)) {
            command.env_remove(name);
        }
        let mut child = command
            .env(ROLE_ENV, WORKER_ROLE)
            .envs(request.bootstrap.to_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;

        Ok(SpawnedWorker {
            process: Box::new(ChildProcess(child)),
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }
}

/// Named-port variables the worker would otherwise inherit. Its ports come
/// from the bootstrap only.
fn inherited_port_vars<I>(names: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    names
        .into_iter()
        .filter(|name| {
            name.as_encoded_bytes()
                .starts_with(PORT_ENV_PREFIX.as_bytes())
        })
        .collect()
}

/// Host callbacks for out-of-band notification (mail, chat, ...). The
/// returned flag says whether delivery worked; it is logged, never retried.
#[async_trait]
pub trait NotifierHooks: Send + Sync {
    async fn on_key_generated(&self, key: &SessionKey) -> bool;

    async fn on_crash_detected(&self, error: &ErrorLike) -> bool;
}

pub struct MonitorOptions {
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Bound on correlated calls to the worker. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Delay before retrying a respawn that failed to start.
    pub respawn_backoff: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            spawner: Arc::new(SelfSpawner),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            respawn_backoff: Duration::from_secs(1),
        }
    }
}

struct ActiveWorker {
    generation: u64,
    pid: Option<u32>,
    channel: Arc<Correlator>,
    terminate: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

pub struct Monitor {
    config: StdMutex<SessionConfig>,
    key: SessionKey,
    options: MonitorOptions,
    listeners: HandlerMap,
    console: Arc<Console>,
    hooks: StdMutex<Option<Arc<dyn NotifierHooks>>>,
    active: StdMutex<Option<ActiveWorker>>,
    generation: AtomicU64,
    finalized: AtomicBool,
    ending: AtomicBool,
    exit_handlers: StdMutex<Vec<ExitHandler>>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl Monitor {
    /// Create the process's monitor: load and validate the configuration
    /// and generate the session key. Fails in the worker role, on a second
    /// call and on a bad configuration.
    pub fn create(role: Role, options: MonitorOptions) -> Result<Arc<Self>, SessionError> {
        if role != Role::Supervisor {
            return Err(SessionError::misuse(
                "cannot create a monitor on the worker process",
            ));
        }
        MONITOR.claim()?;

        println!("{} {}", timestamp(), "initializing session...".cyan());
        let path = config::config_path();
        println!("{} {}", timestamp(), "validating configuration...".cyan());
        let (config, source) = config::load(&path)?;
        match source {
            ConfigSource::File(path) => {
                tracing::info!(path = %path.display(), "Loaded session configuration");
            }
            ConfigSource::Defaults => {
                println!("{}", "Loading default session parameters...".cyan());
                println!(
                    "Consider including a {} configuration file in your project root for customization.",
                    config::DEFAULT_CONFIG_FILE
                );
            }
        }

        Ok(Self::new(config, SessionKey::generate(), options))
    }

    /// Build a monitor from an already resolved configuration. Nothing is
    /// spawned until [`Monitor::finalize`].
    pub fn new(config: SessionConfig, key: SessionKey, options: MonitorOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let console = Arc::new(Console::new(ConsoleConfig {
                identifier: config.identifiers.master.painted().to_string(),
                case_sensitive: false,
            }));
            register_builtin_commands(&console, weak);

            let listeners = HandlerMap::new();
            register_builtin_listeners(&listeners, weak);

            let (exit_tx, _) = watch::channel(None);
            Self {
                config: StdMutex::new(config),
                key,
                options,
                listeners,
                console,
                hooks: StdMutex::new(None),
                active: StdMutex::new(None),
                generation: AtomicU64::new(0),
                finalized: AtomicBool::new(false),
                ending: AtomicBool::new(false),
                exit_handlers: StdMutex::new(Vec::new()),
                exit_tx,
            }
        })
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// Snapshot of the live configuration.
    pub fn config(&self) -> SessionConfig {
        lock(&self.config).clone()
    }

    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    /// Generation of the most recently spawned worker (0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn active_pid(&self) -> Option<u32> {
        lock(&self.active).as_ref().and_then(|worker| worker.pid)
    }

    pub fn is_ending(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    pub fn set_notifier_hooks(&self, hooks: Arc<dyn NotifierHooks>) {
        *lock(&self.hooks) = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn NotifierHooks>> {
        lock(&self.hooks).clone()
    }

    /// Run the key notifier and spawn the first worker. Once only.
    pub async fn finalize(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(SessionError::misuse("session monitor is already finalized"));
        }
        if let Some(hooks) = self.hooks() {
            let delivered = hooks.on_key_generated(&self.key).await;
            if delivered {
                tracing::info!("Session key notification delivered");
            } else {
                tracing::warn!("Session key notification failed");
            }
        }
        self.spawn().map(|_| ())
    }

    /// Kill the active worker (gracefully) and start a new one.
    fn spawn(self: &Arc<Self>) -> Result<u64, SessionError> {
        self.kill_active_worker(true, false);

        let config = self.config();
        let request = SpawnRequest {
            bootstrap: WorkerBootstrap::from_config(&config, &self.key),
            show_output: config.show_server_output,
        };
        let spawned = self
            .options
            .spawner
            .spawn(&request)
            .map_err(SessionError::Spawn)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = spawned.process.pid();
        let channel = Correlator::spawn(
            spawned.reader,
            spawned.writer,
            Arc::new(self.listeners.clone()),
            CorrelatorConfig::new("monitor").with_request_timeout(self.options.request_timeout),
        );
        let (terminate, terminate_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited) = watch::channel(false);

        // `kill_session` sets `ending` before it reads `active`, so checking
        // under the lock means it either sees this worker or we see it ending.
        let installed = {
            let mut active = lock(&self.active);
            if self.is_ending() {
                false
            } else {
                let replaced = active.replace(ActiveWorker {
                    generation,
                    pid,
                    channel: Arc::clone(&channel),
                    terminate,
                    exited,
                });
                if let Some(replaced) = replaced {
                    tracing::debug!(generation = replaced.generation, "Replaced active worker");
                }
                true
            }
        };

        if installed {
            tracing::info!(generation, pid, "Spawned worker");
            self.main_log(
                format!(
                    "spawned new server worker with process id {}",
                    display_pid(pid)
                )
                .cyan(),
            );
        } else {
            tracing::warn!(generation, pid, "Session ended during spawn, stopping new worker");
            if let Err(e) = channel.notify(Message::ManualExit {
                is_session_end: true,
            }) {
                tracing::warn!(error = %e, "Could not send manual exit");
            }
        }

        tokio::spawn(watch_exit(
            Arc::downgrade(self),
            generation,
            spawned.process,
            terminate_rx,
            exited_tx,
            channel,
        ));
        Ok(generation)
    }

    async fn worker_exited(self: Arc<Self>, generation: u64, pid: Option<u32>, exit: ExitInfo) {
        self.main_log(
            format!(
                "server worker with process id {} has exited with {exit}.",
                display_pid(pid)
            )
            .cyan(),
        );

        let was_active = {
            let mut active = lock(&self.active);
            if active
                .as_ref()
                .is_some_and(|worker| worker.generation == generation)
            {
                active.take();
                true
            } else {
                false
            }
        };
        if !was_active {
            tracing::debug!(generation, "Replaced worker exited");
            return;
        }
        if self.is_ending() {
            tracing::debug!(generation, "Session ending, not respawning");
            return;
        }
        self.respawn().await;
    }

    async fn respawn(self: &Arc<Self>) {
        loop {
            if self.is_ending() {
                return;
            }
            match self.spawn() {
                Ok(_) => return,
                Err(e) => {
                    tracing::error!(error = %e, backoff = ?self.options.respawn_backoff, "Respawn failed");
                    self.main_log(format!("unable to spawn a new worker: {e}").red());
                    tokio::time::sleep(self.options.respawn_backoff).await;
                }
            }
        }
    }

    /// Graceful: ask the worker to run its exit handlers and exit.
    /// Forceful: terminate the process.
    fn kill_active_worker(&self, graceful: bool, is_session_end: bool) {
        let active = lock(&self.active);
        let Some(worker) = active.as_ref() else {
            return;
        };
        if *worker.exited.borrow() {
            return;
        }
        tracing::info!(
            generation = worker.generation,
            graceful,
            is_session_end,
            "Killing active worker"
        );
        if graceful {
            if let Err(e) = worker
                .channel
                .notify(Message::ManualExit { is_session_end })
            {
                tracing::warn!(error = %e, "Could not send manual exit");
            }
        } else if worker.terminate.send(()).is_err() {
            tracing::debug!("Worker exit watcher already gone");
        }
    }

    /// End the session: run exit handlers, kill the worker for good, wait
    /// for it to exit, then resolve [`Monitor::wait_for_exit`] with
    /// `error_code`.
    pub async fn kill_session(&self, reason: &str, graceful: bool, error_code: i32) {
        if self.ending.swap(true, Ordering::SeqCst) {
            tracing::debug!(reason, "Session already ending");
            return;
        }
        let how = if graceful { "cleanly" } else { "immediately" };
        self.main_log(format!("exiting session {how}").cyan());
        self.main_log(format!("session exit reason: {}", reason.red()));

        run_exit_handlers(
            self.exit_handlers(),
            ExitReason::Planned {
                is_session_end: true,
            },
        )
        .await;

        let exited = lock(&self.active)
            .as_ref()
            .map(|worker| worker.exited.clone());
        self.kill_active_worker(graceful, true);
        if let Some(mut exited) = exited {
            let _ = exited.wait_for(|exited| *exited).await;
        }

        tracing::info!(error_code, "Session ended");
        self.exit_tx.send_replace(Some(error_code));
    }

    /// Resolves with the process exit code once the session has ended.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut exit_rx = self.exit_tx.subscribe();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(0),
            Err(_) => 1,
        }
    }

    /// Called, in registration order, before the session ends.
    pub fn add_exit_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(ExitReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        lock(&self.exit_handlers).push(boxed_exit_handler(handler));
    }

    fn exit_handlers(&self) -> Vec<ExitHandler> {
        lock(&self.exit_handlers).clone()
    }

    pub fn add_console_command<F, Fut>(&self, name: &str, specs: Vec<ArgSpec>, action: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.console.register_command(name, specs, action);
    }

    /// Feed operator lines from `reader` to the console until EOF.
    pub async fn run_console<R>(&self, reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        Arc::clone(&self.console).run(reader).await;
    }

    /// Handle every notification named `name` from the active worker.
    pub fn on<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.listeners.on(name, move |message| {
            let handler = Arc::clone(&handler);
            async move {
                handler(message).await?;
                Ok(Value::Null)
            }
        });
    }

    pub fn on_crash_detected<F, Fut>(&self, handler: F)
    where
        F: Fn(ErrorLike) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on(Message::CRASH_DETECTED, move |message| {
            let handler = Arc::clone(&handler);
            async move {
                match message {
                    Message::CrashDetected { error } => handler(error).await,
                    _ => Ok(()),
                }
            }
        });
    }

    pub fn on_server_running<F, Fut>(&self, handler: F)
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on(Message::SERVER_RUNNING, move |message| {
            let handler = Arc::clone(&handler);
            async move {
                match message {
                    Message::ServerRunning { is_first_time } => handler(is_first_time).await,
                    _ => Ok(()),
                }
            }
        });
    }

    /// Handle a host-defined action sent by the worker.
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
        self.listeners.on(action, move |message| {
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

    fn active_channel(&self) -> Option<Arc<Correlator>> {
        lock(&self.active)
            .as_ref()
            .map(|worker| Arc::clone(&worker.channel))
    }

    pub fn send_action(&self, action: impl Into<String>, args: Value) -> Reply {
        let Some(channel) = self.active_channel() else {
            return Reply::failure(ErrorLike::failed_dispatch("no active worker"));
        };
        match channel.notify(Message::action(action, args)) {
            Ok(()) => Reply::success(Vec::new()),
            Err(e) => Reply::failure(e.into()),
        }
    }

    pub async fn request_action(&self, action: impl Into<String>, args: Value) -> Reply {
        match self.active_channel() {
            Some(channel) => channel.request(Message::action(action, args)).await,
            None => Reply::failure(ErrorLike::failed_dispatch("no active worker")),
        }
    }

    /// Run `command` through the shell and log its output under the exec
    /// identifier. Failures are logged; `None` means it could not start.
    pub async fn exec(&self, command: &str, cwd: Option<&Path>) -> Option<ExitStatus> {
        let mut shell = shell_command(command);
        shell.stdin(Stdio::null());
        if let Some(cwd) = cwd {
            shell.current_dir(cwd);
        }

        let output = match shell.output().await {
            Ok(output) => output,
            Err(e) => {
                self.exec_log(format!("unable to execute {}", command.white()).red());
                self.exec_log(format!("(error) {e}").red());
                return None;
            }
        };

        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
        {
            self.exec_log(format!("(stdout) {line}").cyan());
        }
        for line in String::from_utf8_lossy(&output.stderr)
            .lines()
            .filter(|line| !line.is_empty())
        {
            self.exec_log(format!("(stderr) {line}").yellow());
        }
        if !output.status.success() {
            self.exec_log(format!("{} exited with {}", command.white(), output.status).red());
        }
        Some(output.status)
    }

    /// Timestamped console line under the monitor's identifier.
    pub fn main_log(&self, message: impl fmt::Display) {
        let identifier = lock(&self.config).identifiers.master.painted();
        println!("{} {identifier} {message}", timestamp());
    }

    fn worker_log(&self, message: impl fmt::Display) {
        let identifier = lock(&self.config).identifiers.worker.painted();
        println!("{} {identifier} {message}", timestamp());
    }

    fn exec_log(&self, message: impl fmt::Display) {
        let identifier = lock(&self.config).identifiers.exec.painted();
        println!("{} {identifier} {message}", timestamp());
    }

    fn set_port(&self, name: &str, value: i64, immediate_restart: bool) -> anyhow::Result<()> {
        lock(&self.config).set_port(name, value)?;
        self.main_log(format!("{name} port set to {value}").cyan());
        if immediate_restart {
            self.kill_active_worker(true, false);
        }
        Ok(())
    }

    async fn set_polling(&self, seconds: i64, push: bool) -> anyhow::Result<()> {
        let changed = lock(&self.config).set_interval(seconds)?;
        if !changed || !push {
            return Ok(());
        }
        let Some(channel) = self.active_channel() else {
            return Ok(());
        };
        let new_polling_interval_seconds = self.config().polling.interval_seconds;
        channel
            .request(Message::UpdatePollingInterval {
                new_polling_interval_seconds,
            })
            .await
            .into_result()?;
        self.main_log(format!("polling interval set to {new_polling_interval_seconds}s").cyan());
        Ok(())
    }
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "?".to_string(), |pid| pid.to_string())
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}

/// Owns the worker process until it exits, forwarding terminate requests.
async fn watch_exit(
    monitor: Weak<Monitor>,
    generation: u64,
    mut process: Box<dyn WorkerProcess>,
    mut terminate_rx: mpsc::UnboundedReceiver<()>,
    exited_tx: watch::Sender<bool>,
    channel: Arc<Correlator>,
) {
    let pid = process.pid();
    let exit = loop {
        tokio::select! {
            status = process.wait() => break status,
            Some(()) = terminate_rx.recv() => {
                if let Err(e) = process.terminate() {
                    tracing::warn!(generation, error = %e, "Failed to terminate worker");
                }
            }
        }
    };
    let exit = exit.unwrap_or_else(|e| {
        tracing::warn!(generation, error = %e, "Failed to wait for worker");
        ExitInfo {
            code: None,
            signal: None,
        }
    });
    tracing::info!(generation, pid, %exit, "Worker exited");

    channel.destroy();
    exited_tx.send_replace(true);

    if let Some(monitor) = monitor.upgrade() {
        monitor.worker_exited(generation, pid, exit).await;
    }
}

fn register_builtin_commands(console: &Console, monitor: &Weak<Monitor>) {
    let clean_or_force = || ArgSpec::one_of(["clean", "force"]);

    let weak = Weak::clone(monitor);
    console.register_command("exit", vec![clean_or_force()], move |args| {
        let weak = Weak::clone(&weak);
        async move {
            let monitor = upgrade(&weak)?;
            let graceful = args.word(0) == Some("clean");
            monitor
                .kill_session("manual exit requested by console", graceful, 0)
                .await;
            Ok(())
        }
    });

    let weak = Weak::clone(monitor);
    console.register_command("restart", vec![clean_or_force()], move |args| {
        let weak = Weak::clone(&weak);
        async move {
            let monitor = upgrade(&weak)?;
            monitor.kill_active_worker(args.word(0) == Some("clean"), false);
            Ok(())
        }
    });

    let weak = Weak::clone(monitor);
    console.register_command(
        "set",
        vec![
            ArgSpec::word(),
            ArgSpec::literal("port"),
            ArgSpec::integer(),
            ArgSpec::boolean(),
        ],
        move |args| {
            let weak = Weak::clone(&weak);
            async move {
                let monitor = upgrade(&weak)?;
                let (Some(name), Some(value), Some(restart)) =
                    (args.word(0), args.integer(2), args.boolean(3))
                else {
                    anyhow::bail!("malformed arguments");
                };
                monitor.set_port(name, value, restart)
            }
        },
    );

    let weak = Weak::clone(monitor);
    console.register_command(
        "set",
        vec![
            ArgSpec::literal("polling"),
            ArgSpec::integer(),
            ArgSpec::boolean(),
        ],
        move |args| {
            let weak = Weak::clone(&weak);
            async move {
                let monitor = upgrade(&weak)?;
                let (Some(seconds), Some(push)) = (args.integer(1), args.boolean(2)) else {
                    anyhow::bail!("malformed arguments");
                };
                monitor.set_polling(seconds, push).await
            }
        },
    );
}

fn register_builtin_listeners(listeners: &HandlerMap, monitor: &Weak<Monitor>) {
    let weak = Weak::clone(monitor);
    listeners.on(Message::KILL, move |message| {
        let weak = Weak::clone(&weak);
        async move {
            if let Message::Kill {
                reason,
                graceful,
                error_code,
            } = message
            {
                upgrade(&weak)?
                    .kill_session(&reason, graceful, error_code)
                    .await;
            }
            Ok(Value::Null)
        }
    });

    let weak = Weak::clone(monitor);
    listeners.on(Message::LIFECYCLE, move |message| {
        let weak = Weak::clone(&weak);
        async move {
            if let Message::Lifecycle { event } = message {
                upgrade(&weak)?.worker_log(format!("lifecycle phase ({event})"));
            }
            Ok(Value::Null)
        }
    });

    let weak = Weak::clone(monitor);
    listeners.on(Message::CRASH_DETECTED, move |message| {
        let weak = Weak::clone(&weak);
        async move {
            let Message::CrashDetected { error } = message else {
                return Ok(Value::Null);
            };
            let monitor = upgrade(&weak)?;
            tracing::error!(%error, "Worker reported a crash");
            monitor.main_log(format!("crash detected: {}", error.to_string().red()));
            if let Some(hooks) = monitor.hooks() {
                let delivered = hooks.on_crash_detected(&error).await;
                if delivered {
                    tracing::info!("Crash notification delivered");
                } else {
                    tracing::warn!("Crash notification failed");
                }
            }
            Ok(Value::Null)
        }
    });

    let weak = Weak::clone(monitor);
    listeners.on(Message::SERVER_RUNNING, move |message| {
        let weak = Weak::clone(&weak);
        async move {
            if let Message::ServerRunning { is_first_time } = message {
                let note = if is_first_time { "" } else { " again" };
                upgrade(&weak)?.main_log(format!("server is running{note}").green());
            }
            Ok(Value::Null)
        }
    });
}

fn upgrade(monitor: &Weak<Monitor>) -> anyhow::Result<Arc<Monitor>> {
    monitor
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("monitor has shut down"))
}
