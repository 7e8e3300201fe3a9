//! Isolated context agent binary entry point
//!
//! Run with: testhost-agent (started by the host, one process per context)
//!
//! The agent speaks newline-delimited JSON on stdin/stdout, so logs go to stderr.

use std::process;
use std::sync::Arc;

use testhost::agent::{self, ContractRegistry};
use testhost::version::TESTHOST_VERSION;

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
    tracing::debug!(version = TESTHOST_VERSION, pid = process::id(), "agent starting");

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let registry = Arc::new(ContractRegistry::builtin());

    if let Err(error) = agent::serve(stdin, stdout, registry).await {
        tracing::error!(%error, "agent stopped");
        process::exit(1);
    }
}
