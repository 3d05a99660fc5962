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

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Operational settings for the proxy.
///
/// Every field has a default matching the container contract (fixed paths
/// under `/config`, `/ca`, `/logs` and the listener on `0.0.0.0:58080`), so
/// the settings file is entirely optional. A TOML file is only needed for
/// non-container deployments and tests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Listener configuration (bind address, port, connection limits).
    pub listener: ListenerSettings,
    /// Certificate authority storage and leaf-cache sizing.
    pub ca: CaSettings,
    /// Location of the JSON rules file.
    pub rules: RuleFileSettings,
    /// Location of the JSONL traffic log.
    pub traffic_log: TrafficLogSettings,
    /// Upstream dialing behavior.
    pub upstream: UpstreamSettings,
}

impl ProxySettings {
    /// Reads and deserializes a TOML settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let cfg: ProxySettings = toml::from_str(&raw)
            .with_context(|| format!("invalid settings file: {}", path.display()))?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Bind address; the redirector delivers intercepted traffic here.
    pub bind_address: String,
    /// TCP port for inbound connections. Port 0 binds an ephemeral port
    /// (used by the integration tests).
    pub bind_port: u16,
    /// Cap on concurrently handled connections; excess accepts are dropped.
    pub max_connections: usize,
    /// How long shutdown waits for in-flight connections to drain.
    pub shutdown_grace_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            bind_port: 58080,
            max_connections: 1024,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaSettings {
    /// Root directory for CA material; the certificate lands at
    /// `<dir>/certs/ca.pem` and the key at `<dir>/keys/ca.key`.
    pub dir: PathBuf,
    /// Upper bound on cached leaf certificates (LRU-evicted).
    pub leaf_cache_capacity: usize,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/ca"),
            leaf_cache_capacity: 1024,
        }
    }
}

impl CaSettings {
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join("certs").join("ca.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join("keys").join("ca.key")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleFileSettings {
    /// JSON rules file, read at startup and on SIGHUP.
    pub path: PathBuf,
}

impl Default for RuleFileSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/config/rules.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrafficLogSettings {
    /// Append-only JSON Lines audit log.
    pub path: PathBuf,
}

impl Default for TrafficLogSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/logs/traffic.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Port dialed for plaintext HTTP connections.
    pub http_port: u16,
    /// Port dialed for TLS connections.
    pub https_port: u16,
    /// Try IPv4 addresses before IPv6 when a name resolves to both.
    pub prefer_ipv4: bool,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            prefer_ipv4: true,
        }
    }
}
