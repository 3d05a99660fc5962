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

//! Append-only JSON Lines traffic log.
//!
//! Entries are funneled through a bounded channel to a single writer task so
//! lines never interleave mid-record. Recording is best-effort and never
//! blocks request handling: a full channel or a failed write drops the entry
//! with a diagnostic on stderr.

use std::{fs, path::Path};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::{
    config::rules::Mode,
    utils::error::{ProxyError, ProxyResult},
};

const CHANNEL_CAPACITY: usize = 1024;

/// Disposition of one observed HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Block,
}

/// One audit record. Serialized as a single self-delimited JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficEntry {
    pub timestamp: String,
    pub action: Action,
    pub mode: &'static str,
    pub host: String,
    pub path: String,
    pub method: String,
    pub reason: String,
}

impl TrafficEntry {
    pub fn new(
        action: Action,
        mode: Mode,
        host: &str,
        path: &str,
        method: &str,
        reason: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            action,
            mode: mode.as_str(),
            host: host.to_string(),
            path: path.to_string(),
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Cloneable handle feeding the single writer task.
#[derive(Clone)]
pub struct TrafficLog {
    tx: mpsc::Sender<TrafficEntry>,
}

impl TrafficLog {
    /// Opens (or creates) the log file in append mode and spawns the writer
    /// task. The file is created 0600; the surrounding directory 0755.
    /// Failure here is a fatal startup error.
    pub fn open(path: &Path) -> ProxyResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::TrafficLog(format!("{}: {e}", parent.display())))?;
            #[cfg(unix)]
            {
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o755));
            }
        }

        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options
            .open(path)
            .map_err(|e| ProxyError::TrafficLog(format!("{}: {e}", path.display())))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(write_loop(tokio::fs::File::from_std(file), rx));

        Ok(Self { tx })
    }

    /// Queues one entry. Never blocks; drops with a diagnostic if the writer
    /// cannot keep up.
    pub fn record(&self, entry: TrafficEntry) {
        if self.tx.try_send(entry).is_err() {
            tracing::warn!("traffic log backlogged, dropping entry");
        }
    }
}

async fn write_loop(mut file: tokio::fs::File, mut rx: mpsc::Receiver<TrafficEntry>) {
    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!("failed to serialize traffic entry: {err}");
                continue;
            }
        };
        line.push('\n');
        // One write per line; O_APPEND keeps concurrent writers from
        // overwriting each other.
        if let Err(err) = file.write_all(line.as_bytes()).await {
            tracing::error!("failed to append traffic entry: {err}");
        }
    }
}
