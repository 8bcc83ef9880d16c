//! Session entry point.
//!
//! A host implements [`SessionAgent`] once and calls [`launch`] from `main`.
//! The same binary runs as both processes: [`Role::detect`] decides which
//! side this process is, and `launch` builds the matching agent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::SinkExt;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::JsonCodec;
use crate::bridge::{Envelope, Message};
use crate::error::SessionError;
use crate::monitor::{Monitor, MonitorOptions};
use crate::worker::{WorkerAgent, WorkerHandle, WorkerOptions};

/// Set to `worker` in the environment of every spawned worker.
pub const ROLE_ENV: &str = "SESSION_ROLE";
pub const WORKER_ROLE: &str = "worker";

static LAUNCH: Singleton = Singleton::new("session agent");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker,
}

impl Role {
    pub fn detect() -> Self {
        Self::from_env_value(std::env::var(ROLE_ENV).ok().as_deref())
    }

    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(WORKER_ROLE) => Self::Worker,
            _ => Self::Supervisor,
        }
    }
}

/// Guards something that may exist at most once per process.
pub struct Singleton {
    claimed: AtomicBool,
    what: &'static str,
}

impl Singleton {
    pub const fn new(what: &'static str) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            what,
        }
    }

    pub fn claim(&self) -> Result<(), SessionError> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::misuse(format!(
                "cannot create more than one {}",
                self.what
            )));
        }
        Ok(())
    }
}

/// Host-side customization of a session.
#[async_trait]
pub trait SessionAgent: Send + Sync + 'static {
    /// Supervisor only. Register console commands, listeners, notifier
    /// hooks and exit handlers before the first worker is spawned.
    async fn initialize_monitor(&self, monitor: &Arc<Monitor>) -> anyhow::Result<()>;

    /// Worker only. Runs before [`SessionAgent::work`]; a failure is a crash.
    async fn initialize_worker(&self, worker: WorkerHandle) -> anyhow::Result<()> {
        let _ = worker;
        Ok(())
    }

    /// Worker only. Start the service the worker supervises. Returning an
    /// error is a crash; returning `Ok` leaves the worker running until an
    /// exit path fires.
    async fn work(&self, worker: WorkerHandle) -> anyhow::Result<()>;
}

/// Run this process's side of the session to completion and return the
/// process exit code.
pub async fn launch(agent: Arc<dyn SessionAgent>, role: Role) -> i32 {
    if let Err(e) = LAUNCH.claim() {
        return misuse(role, &e).await;
    }
    tracing::debug!(?role, "Launching session agent");
    match role {
        Role::Supervisor => launch_monitor(agent).await,
        Role::Worker => launch_worker(agent).await,
    }
}

async fn launch_monitor(agent: Arc<dyn SessionAgent>) -> i32 {
    let monitor = match created_monitor(Monitor::create(
        Role::Supervisor,
        MonitorOptions::default(),
    ))
    .await
    {
        Ok(monitor) => monitor,
        Err(code) => return code,
    };

    if let Err(e) = agent.initialize_monitor(&monitor).await {
        tracing::error!(error = format!("{e:#}"), "Monitor initialization failed");
        return 1;
    }
    if let Err(e) = monitor.finalize().await {
        tracing::error!(error = %e, "Could not start the first worker");
        return 1;
    }

    let console = Arc::clone(&monitor);
    tokio::spawn(async move {
        console
            .run_console(tokio::io::BufReader::new(tokio::io::stdin()))
            .await;
    });

    monitor.wait_for_exit().await
}

/// A bad configuration is logged and exits 0. Any other failure is misuse.
async fn created_monitor(
    created: Result<Arc<Monitor>, SessionError>,
) -> Result<Arc<Monitor>, i32> {
    match created {
        Ok(monitor) => Ok(monitor),
        Err(SessionError::Config(e)) => {
            tracing::error!(error = %e, "Session configuration failed");
            eprintln!("Session configuration failed: {e}");
            Err(0)
        }
        Err(e) => Err(misuse(Role::Supervisor, &e).await),
    }
}

async fn launch_worker(agent: Arc<dyn SessionAgent>) -> i32 {
    let worker = match WorkerAgent::create(Role::Worker, WorkerOptions::default()) {
        Ok(worker) => worker,
        Err(e) => return misuse(Role::Worker, &e).await,
    };

    let work = Arc::clone(&agent);
    let launched = worker.launch_work(move |handle| async move {
        work.initialize_worker(handle.clone()).await?;
        work.work(handle).await
    });
    if let Err(e) = launched {
        return misuse(Role::Worker, &e).await;
    }

    worker.wait_for_exit().await
}

/// Log a misuse and, in a worker, ask the supervisor to end the session.
async fn misuse(role: Role, error: &SessionError) -> i32 {
    tracing::error!(?role, error = %error, "Session misuse");
    if role == Role::Worker {
        notify_kill_upward(&error.to_string()).await;
    }
    1
}

/// Best effort: write one `kill` frame straight to stdout.
async fn notify_kill_upward(reason: &str) {
    let kill = Message::Kill {
        reason: reason.to_string(),
        graceful: false,
        error_code: 1,
    };
    let mut frames = FramedWrite::new(tokio::io::stdout(), JsonCodec::<Envelope>::new());
    if let Err(e) = frames.send(Envelope::notify(&kill)).await {
        tracing::debug!(error = %e, "Could not report misuse to the supervisor");
    }
}
