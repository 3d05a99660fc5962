/* Secure Proxy (AGPL-3.0)

Copyright (C) 2025 - Secure Proxy Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::path::PathBuf;

use clap::Parser;
use secure_proxy::{app, config::ProxySettings, utils::init_tracing};

/// Command-line interface definition using clap's derive API.
///
/// Minimal surface area: only expose the settings file path and logging
/// format. All behavioral configuration (which hosts and paths are allowed,
/// monitor vs enforce) lives in the rules file, which is reloaded on SIGHUP
/// without a restart. The optional TOML settings file only relocates paths
/// and ports for non-container deployments.
#[derive(Debug, Parser)]
#[command(name = "secure-proxy", about = "Egress allowlisting MITM proxy")]
struct Cli {
    /// Path to an optional TOML settings file.
    ///
    /// Without it the container defaults apply: rules at /config/rules.json,
    /// CA under /ca, traffic log at /logs/traffic.jsonl, listener on
    /// 0.0.0.0:58080.
    ///
    /// Usage:
    /// ```sh
    /// # Container defaults
    /// ./secure-proxy
    ///
    /// # Relocated paths (local development, tests)
    /// ./secure-proxy --config ./proxy.toml
    /// ```
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit JSON-formatted diagnostics instead of human-readable output.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

/// Application entry point: parse CLI, initialize logging, load settings,
/// run the proxy until a termination signal arrives.
///
/// Startup sequence:
/// 1. Parse command-line arguments (clap validates types and flags)
/// 2. Initialize the tracing subscriber (stderr, compact or JSON)
/// 3. Load the TOML settings file, or fall back to the container defaults
/// 4. `app::start` builds every component: rule store, traffic log, CA
///    (writes `ca.pem`, the external readiness signal), upstream connector,
///    and finally the listener
/// 5. Block on SIGINT/SIGTERM, then drain in-flight connections
///
/// **Exit codes:**
/// 0 on clean shutdown; 1 on fatal startup failure (CA path unwritable,
/// traffic log unopenable, bind refused), via the `anyhow::Result` return.
///
/// **Async runtime:**
/// `#[tokio::main]` creates a multi-threaded tokio runtime (one worker per
/// core by default) and runs this function on it; every accepted connection
/// becomes an independent task on that runtime.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments (exits with a usage message if invalid)
    let cli = Cli::parse();

    // Initialize tracing (must happen before any tracing:: calls)
    init_tracing(cli.json_logs);

    // Load the settings file when given; otherwise the container defaults
    let settings = match &cli.config {
        Some(path) => ProxySettings::load(path)?,
        None => ProxySettings::default(),
    };

    // Build every component and bind the listener; fatal errors exit 1 here
    let handle = app::start(settings).await?;
    tracing::info!(addr = %handle.addr, "secure proxy ready");

    // Serve until SIGINT/SIGTERM, then stop accepting and drain
    app::wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections");
    handle.shutdown();
    handle.wait().await;

    Ok(())
}
