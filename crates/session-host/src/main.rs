//! session-host: runs a small HTTP service under a resilient session.
//!
//! Started without `SESSION_ROLE` this process is the supervisor; it
//! re-executes itself as the worker that actually serves HTTP.

mod host;
mod routes;

use std::sync::Arc;

use resilient_session::{Role, launch, logging};

#[tokio::main]
async fn main() {
    logging::init_tracing(&["session_host"]);
    let code = launch(Arc::new(host::HostAgent::default()), Role::detect()).await;
    std::process::exit(code);
}
