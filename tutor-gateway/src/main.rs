//! Tutor Gateway - Main entry point.

use anyhow::{bail, Result};
use tutor_common::config::Config;
use tutor_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!("Tutor Gateway v{}", env!("CARGO_PKG_VERSION"));

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("{problem}");
        }
        bail!("invalid configuration: {}", problems.join("; "));
    }

    if config.auth.uses_default_credentials() {
        tracing::warn!("Admin credentials are the defaults; set ADMIN_USERNAME and ADMIN_PASSWORD");
    }

    tutor_gateway::start_server(&config).await
}
