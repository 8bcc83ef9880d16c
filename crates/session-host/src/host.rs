//! The host's session agent.

use std::sync::Arc;

use async_trait::async_trait;
use resilient_session::monitor::{Monitor, NotifierHooks};
use resilient_session::{ErrorLike, SessionAgent, SessionKey, WorkerHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::routes::{SessionControl, routes};

pub struct HostAgent {
    /// Flipped by the worker's exit handler to stop the HTTP server.
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for HostAgent {
    fn default() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(shutdown),
        }
    }
}

/// Logs instead of mailing; there is nobody to deliver to.
struct LoggingNotifier;

#[async_trait]
impl NotifierHooks for LoggingNotifier {
    async fn on_key_generated(&self, key: &SessionKey) -> bool {
        tracing::info!(session_key = %key, "Session key generated");
        true
    }

    async fn on_crash_detected(&self, error: &ErrorLike) -> bool {
        tracing::error!(name = %error.name, message = %error.message, "Worker crash report");
        true
    }
}

#[async_trait]
impl SessionAgent for HostAgent {
    async fn initialize_monitor(&self, monitor: &Arc<Monitor>) -> anyhow::Result<()> {
        monitor.set_notifier_hooks(Arc::new(LoggingNotifier));

        let weak = Arc::downgrade(monitor);
        monitor.add_console_command("status", vec![], move |_| {
            let weak = weak.clone();
            async move {
                let monitor = weak
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("monitor has shut down"))?;
                let pid = monitor
                    .active_pid()
                    .map_or_else(|| "none".to_string(), |pid| pid.to_string());
                monitor.main_log(format!(
                    "generation {} (worker pid {pid})",
                    monitor.generation()
                ));
                Ok(())
            }
        });

        let weak = Arc::downgrade(monitor);
        monitor.add_console_command("pull", vec![], move |_| {
            let weak = weak.clone();
            async move {
                let monitor = weak
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("monitor has shut down"))?;
                monitor.exec("git pull", None).await;
                Ok(())
            }
        });

        monitor.on_server_running(|is_first_time| async move {
            tracing::info!(is_first_time, "Worker service is up");
            Ok(())
        });
        monitor.add_exit_handler(|reason| async move {
            tracing::info!(?reason, "Session shutting down");
        });
        Ok(())
    }

    async fn initialize_worker(&self, worker: WorkerHandle) -> anyhow::Result<()> {
        let shutdown = Arc::clone(&self.shutdown);
        worker.add_exit_handler(move |reason| {
            let shutdown = Arc::clone(&shutdown);
            async move {
                tracing::info!(crash = reason.is_crash(), "Stopping HTTP service");
                shutdown.send_replace(true);
            }
        });
        Ok(())
    }

    async fn work(&self, worker: WorkerHandle) -> anyhow::Result<()> {
        let port = worker.server_port();
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "HTTP service listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let app = routes(Arc::new(worker) as Arc<dyn SessionControl>);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await?;
        tracing::info!("HTTP service stopped");
        Ok(())
    }
}
