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

//! Process wiring and lifecycle.
//!
//! Startup order matters: the rule store and traffic log come up first, the
//! CA last, because `ca.pem` appearing on disk is the readiness signal
//! external entrypoints wait for. Rules reload on SIGHUP without touching
//! in-flight snapshots.

use std::sync::Arc;

use crate::{
    config::{rules::RuleStore, settings::ProxySettings},
    proxy::{self, bridge::Bridge, server::ProxyHandle, upstream::UpstreamConnector},
    tls::authority::CertAuthority,
    traffic::TrafficLog,
    utils::error::{ProxyError, ProxyResult},
};

/// Builds every component and starts the listener.
///
/// Fatal failures (rules dir aside, CA unwritable, log unopenable, bind
/// refused) surface as errors; the caller exits 1.
pub async fn start(settings: ProxySettings) -> ProxyResult<ProxyHandle> {
    // Multiple crypto providers may be linked in; pin the default once.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let rules = Arc::new(RuleStore::open(settings.rules.path.clone()));
    let traffic = TrafficLog::open(&settings.traffic_log.path)?;

    let ca_settings = settings.ca.clone();
    let authority = tokio::task::spawn_blocking(move || CertAuthority::open(&ca_settings))
        .await
        .map_err(|e| ProxyError::CaInit(format!("authority init task failed: {e}")))??;
    let authority = Arc::new(authority);

    spawn_reload_task(Arc::clone(&rules));

    let upstream = Arc::new(UpstreamConnector::new(&settings.upstream));
    let bridge = Arc::new(Bridge::new(
        authority,
        rules,
        traffic,
        upstream,
        settings.upstream.clone(),
    ));

    proxy::server::start(&settings.listener, bridge).await
}

/// SIGHUP re-reads the rules file; a bad file keeps the active snapshot.
#[cfg(unix)]
fn spawn_reload_task(rules: Arc<RuleStore>) {
    tokio::spawn(async move {
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!("cannot install SIGHUP handler: {err}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            if let Err(err) = rules.reload() {
                tracing::warn!("rules reload failed, keeping previous snapshot: {err}");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_task(_rules: Arc<RuleStore>) {}

/// Blocks until the process receives a termination signal.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!("cannot install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
