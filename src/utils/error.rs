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

use thiserror::Error;

use crate::proxy::http::HttpError;
use crate::proxy::peek::PeekError;
use crate::proxy::upstream::UpstreamError;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Crate-wide error taxonomy.
///
/// Startup failures (`Bind`, `CaInit`, `TrafficLog`) are fatal; everything
/// else is scoped to a single connection and must never take the process down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate authority init failed: {0}")]
    CaInit(String),

    #[error("certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid rules file {path}: {detail}")]
    Rules { path: String, detail: String },

    #[error("traffic log unavailable: {0}")]
    TrafficLog(String),

    #[error("connection preamble error: {0}")]
    Peek(#[from] PeekError),

    #[error("HTTP parse error: {0}")]
    Http(#[from] HttpError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Short stable label used when an internal failure is surfaced in the
    /// traffic log as `internal:<kind>`.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ProxyError::Bind { .. } => "bind",
            ProxyError::CaInit(_) => "ca-init",
            ProxyError::CertGen(_) => "cert-mint",
            ProxyError::Tls(_) => "tls-config",
            ProxyError::Rules { .. } => "rules",
            ProxyError::TrafficLog(_) => "traffic-log",
            ProxyError::Peek(_) => "peek",
            ProxyError::Http(_) => "http-parse",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::Io(_) => "io",
        }
    }
}
