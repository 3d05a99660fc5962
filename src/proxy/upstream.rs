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

//! Upstream dialing.
//!
//! The proxy re-originates each allowed connection: DNS-resolve the peeked
//! hostname, TCP-connect (IPv4 first by default), and for TLS targets run a
//! handshake with the original SNI, validating the origin certificate against
//! the webpki root set. The connector and its root store are built once at
//! startup and shared across connections.

use std::{net::SocketAddr, sync::Arc};

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::{
    net::{lookup_host, TcpStream},
    time::{timeout, Duration},
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::config::settings::UpstreamSettings;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("DNS resolution for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("DNS resolution for {host} returned no addresses")]
    NoAddresses { host: String },
    #[error("TCP connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("TCP connect to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },
    #[error("invalid upstream hostname {host}")]
    InvalidName { host: String },
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake with {host} timed out")]
    TlsTimeout { host: String },
}

impl UpstreamError {
    /// Stable label used in traffic-log reasons (`Upstream <kind>`).
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Dns { .. } | UpstreamError::NoAddresses { .. } => "DNS Error",
            UpstreamError::Connect { .. } => "Connect Error",
            UpstreamError::ConnectTimeout { .. } => "Connect Timeout",
            UpstreamError::InvalidName { .. } => "Invalid Hostname",
            UpstreamError::Tls { .. } => "TLS Error",
            UpstreamError::TlsTimeout { .. } => "TLS Timeout",
        }
    }

    /// Reason string for the traffic log. Most kinds log as the bare
    /// `Upstream <kind>` label; certificate validation failures append the
    /// underlying TLS error so a rejected upstream certificate is
    /// distinguishable from a connect or DNS failure.
    pub fn reason(&self) -> String {
        match self {
            UpstreamError::Tls { source, .. } => {
                format!("Upstream {}: {source}", self.kind())
            }
            _ => format!("Upstream {}", self.kind()),
        }
    }
}

/// Shared upstream connector.
pub struct UpstreamConnector {
    connector: TlsConnector,
    prefer_ipv4: bool,
}

impl UpstreamConnector {
    pub fn new(settings: &UpstreamSettings) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            connector: TlsConnector::from(Arc::new(config)),
            prefer_ipv4: settings.prefer_ipv4,
        }
    }

    /// Resolves and TCP-connects, trying each address until one succeeds.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
        let mut addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| UpstreamError::Dns {
                host: host.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(UpstreamError::NoAddresses {
                host: host.to_string(),
            });
        }
        if self.prefer_ipv4 {
            addrs.sort_by_key(|addr| !addr.is_ipv4());
        }

        let mut last_err = None;
        for addr in addrs {
            match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!(%addr, %host, "upstream TCP connected");
                    return Ok(stream);
                }
                Ok(Err(source)) => {
                    tracing::debug!(%addr, %host, error = %source, "upstream connect failed");
                    last_err = Some(UpstreamError::Connect { addr, source });
                }
                Err(_) => {
                    tracing::debug!(%addr, %host, "upstream connect timed out");
                    last_err = Some(UpstreamError::ConnectTimeout { addr });
                }
            }
        }
        Err(last_err.unwrap_or(UpstreamError::NoAddresses {
            host: host.to_string(),
        }))
    }

    /// TLS handshake over an established TCP stream, SNI = original hostname.
    pub async fn connect_tls(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, UpstreamError> {
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| UpstreamError::InvalidName {
                host: host.to_string(),
            })?;

        match timeout(
            TLS_HANDSHAKE_TIMEOUT,
            self.connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(source)) => Err(UpstreamError::Tls {
                host: host.to_string(),
                source,
            }),
            Err(_) => Err(UpstreamError::TlsTimeout {
                host: host.to_string(),
            }),
        }
    }
}
