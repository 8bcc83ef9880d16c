//! resilient-session: a supervisor/worker session runtime.
//!
//! One binary, two processes. The supervisor ([`Monitor`]) loads the
//! configuration, spawns a single worker and respawns it whenever it exits.
//! The worker ([`WorkerAgent`]) runs the host's service and polls its health
//! route, reporting crashes upward before exiting. The two talk over the
//! worker's stdin/stdout through a correlated message channel ([`bridge`]).

pub mod agent;
pub mod bridge;
pub mod config;
pub mod console;
pub mod error;
mod fd_redirect;
pub mod health;
pub mod key;
pub mod logging;
pub mod monitor;
pub mod worker;

pub use agent::{Role, SessionAgent, launch};
pub use bridge::{ChannelError, ErrorLike, Message, Reply};
pub use config::{ConfigError, SessionConfig};
pub use console::{Arg, ArgSpec, Args, Console, Dispatch};
pub use error::SessionError;
pub use health::Health;
pub use key::SessionKey;
pub use monitor::{Monitor, MonitorOptions, NotifierHooks, WorkerSpawner};
pub use worker::{ExitReason, WorkerAgent, WorkerBootstrap, WorkerHandle, WorkerOptions};
