#![forbid(unsafe_code)]

//! Binary entrypoint wiring the Skiff services together.

mod bootstrap;
mod error;

use error::AppResult;

/// Boots the service and blocks until shutdown. Exits `0` after a graceful
/// signal-driven shutdown, non-zero on fatal initialisation failure.
#[tokio::main]
async fn main() -> AppResult<()> {
    bootstrap::run_app().await
}
