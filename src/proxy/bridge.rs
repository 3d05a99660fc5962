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

//! The MITM bridge.
//!
//! Per connection: classify the preamble, mint a leaf for the SNI hostname,
//! terminate TLS on the client side while originating a validated TLS session
//! upstream, then relay. The relay parses request heads off the client byte
//! stream so every request on a keep-alive connection is individually
//! evaluated and logged, and forwards everything else verbatim with
//! backpressure (writes are awaited in-loop; a stalled peer stalls the
//! opposite read).
//!
//! Per-connection state machine:
//! `Peeking -> Handshaking -> AwaitingRequest -> Evaluating ->
//! (Forwarding | Responding403) -> Closing`, where any error short-circuits
//! to `Closing` after a best-effort log entry.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    time::{timeout, Duration},
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::{
        rules::{Mode, RuleStore},
        settings::UpstreamSettings,
    },
    policy::{self, Verdict},
    proxy::{
        http::{
            bad_gateway_response, find_head_end, forbidden_response, parse_head, BodyFraming,
            HttpError, MAX_HEAD,
        },
        peek::{read_preamble, Preamble, Protocol, ReplayStream},
        upstream::UpstreamConnector,
    },
    tls::authority::CertAuthority,
    traffic::{Action, TrafficEntry, TrafficLog},
    utils::error::ProxyResult,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// No bytes in either direction for this long closes the connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Object-safe alias for the two stream flavors the relay bridges
/// (client-side terminated TLS or raw TCP, upstream TLS or raw TCP).
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

type BoxedIo = Box<dyn IoStream>;

enum Inbound {
    /// Accumulating the next request head.
    Head,
    /// Forwarding a framed request body.
    Body(BodyFraming),
}

enum Event {
    Client(std::io::Result<usize>),
    Upstream(std::io::Result<usize>),
}

enum Flow {
    Continue,
    Close,
}

/// Shared per-process bridge state handed to every connection task.
pub struct Bridge {
    authority: Arc<CertAuthority>,
    rules: Arc<RuleStore>,
    traffic: TrafficLog,
    upstream: Arc<UpstreamConnector>,
    ports: UpstreamSettings,
}

impl Bridge {
    pub fn new(
        authority: Arc<CertAuthority>,
        rules: Arc<RuleStore>,
        traffic: TrafficLog,
        upstream: Arc<UpstreamConnector>,
        ports: UpstreamSettings,
    ) -> Self {
        Self {
            authority,
            rules,
            traffic,
            upstream,
            ports,
        }
    }

    /// Drives one accepted connection to completion.
    ///
    /// Preamble failures close silently (no traffic entry). Errors after
    /// classification emit a best-effort `internal:<kind>` entry before
    /// bubbling up for the listener's diagnostics.
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        let preamble = match read_preamble(&mut stream).await {
            Ok(preamble) => preamble,
            Err(err) => {
                tracing::debug!(%peer, "closing unclassifiable connection: {err}");
                return Ok(());
            }
        };

        let host = preamble.host.clone();
        tracing::debug!(%peer, %host, protocol = ?preamble.protocol, "classified connection");

        let result = match preamble.protocol {
            Protocol::Tls => self.tls_session(stream, peer, preamble).await,
            Protocol::Http => self.http_session(stream, peer, preamble).await,
        };

        if let Err(err) = &result {
            let mode = self.rules.current().mode;
            self.traffic.record(TrafficEntry::new(
                Action::Block,
                mode,
                &host,
                "/",
                "CONNECT",
                &format!("internal:{}", err.kind_label()),
            ));
        }
        result
    }

    /// TLS path: leaf mint, client handshake, upstream origination, relay.
    ///
    /// The upstream dial runs concurrently with the client handshake, but
    /// only when the host-level precheck passes; a host that cannot match
    /// any rule never causes an outbound connection. The client handshake
    /// still completes in that case so the 403 is deliverable over TLS.
    async fn tls_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        preamble: Preamble,
    ) -> ProxyResult<()> {
        let host = preamble.host;
        let snapshot = self.rules.current();
        let may_dial = policy::host_permitted(&snapshot, &host);

        let leaf = self.authority.leaf_for(&host).await?;
        let acceptor = TlsAcceptor::from(leaf.server_config.clone());
        let client_io = ReplayStream::new(preamble.buffered, stream);
        let accept = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(client_io));

        let (client, upstream) = if may_dial {
            let (accept_res, upstream_res) =
                tokio::join!(accept, self.open_upstream(Protocol::Tls, &host));
            let client = match flatten_accept(accept_res) {
                Ok(client) => client,
                Err(reason) => {
                    self.log_connection_block(snapshot.mode, &host, &reason);
                    tracing::debug!(%peer, %host, %reason, "client handshake failed");
                    return Ok(());
                }
            };
            match upstream_res {
                Ok(upstream) => (client, Some(upstream)),
                Err(err) => {
                    let reason = err.reason();
                    self.log_connection_block(snapshot.mode, &host, &reason);
                    tracing::warn!(%peer, %host, error = %err, "upstream unavailable");
                    return Ok(());
                }
            }
        } else {
            match flatten_accept(accept.await) {
                Ok(client) => (client, None),
                Err(reason) => {
                    self.log_connection_block(snapshot.mode, &host, &reason);
                    tracing::debug!(%peer, %host, %reason, "client handshake failed");
                    return Ok(());
                }
            }
        };

        tracing::debug!(%peer, %host, "client handshake complete");
        self.relay(Box::new(client), upstream, &host, Protocol::Tls, peer)
            .await
    }

    /// Plaintext path: no handshakes, upstream dialed on first allowed
    /// request (dial failure answers 502).
    async fn http_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        preamble: Preamble,
    ) -> ProxyResult<()> {
        let host = preamble.host;
        let client = ReplayStream::new(preamble.buffered, stream);
        self.relay(Box::new(client), None, &host, Protocol::Http, peer)
            .await
    }

    async fn open_upstream(&self, protocol: Protocol, host: &str) -> Result<BoxedIo, crate::proxy::upstream::UpstreamError> {
        match protocol {
            Protocol::Tls => {
                let tcp = self.upstream.dial(host, self.ports.https_port).await?;
                let tls = self.upstream.connect_tls(host, tcp).await?;
                Ok(Box::new(tls))
            }
            Protocol::Http => {
                let tcp = self.upstream.dial(host, self.ports.http_port).await?;
                Ok(Box::new(tcp))
            }
        }
    }

    fn log_connection_block(&self, mode: Mode, host: &str, reason: &str) {
        self.traffic.record(TrafficEntry::new(
            Action::Block,
            mode,
            host,
            "/",
            "CONNECT",
            reason,
        ));
    }

    /// Bidirectional relay with per-request evaluation.
    ///
    /// Upstream bytes are copied to the client opaquely. Client bytes are
    /// either head accumulation (parsed, evaluated, logged, then forwarded)
    /// or framed body passthrough, so request boundaries on keep-alive
    /// connections are known without buffering bodies.
    async fn relay(
        &self,
        client: BoxedIo,
        upstream: Option<BoxedIo>,
        host: &str,
        protocol: Protocol,
        peer: SocketAddr,
    ) -> ProxyResult<()> {
        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut ur, mut uw) = match upstream {
            Some(upstream) => {
                let (r, w) = tokio::io::split(upstream);
                (Some(r), Some(w))
            }
            None => (None, None),
        };

        let mut acc = BytesMut::with_capacity(4096);
        let mut inbound = Inbound::Head;
        let mut cbuf = vec![0u8; 8 * 1024];
        let mut ubuf = vec![0u8; 16 * 1024];
        let mut client_open = true;

        loop {
            if !client_open && ur.is_none() {
                return Ok(());
            }

            let event = timeout(IDLE_TIMEOUT, async {
                tokio::select! {
                    res = async {
                        if client_open {
                            cr.read(&mut cbuf).await
                        } else {
                            std::future::pending().await
                        }
                    } => Event::Client(res),
                    res = async {
                        match ur.as_mut() {
                            Some(r) => r.read(&mut ubuf).await,
                            None => std::future::pending().await,
                        }
                    } => Event::Upstream(res),
                }
            })
            .await;

            let event = match event {
                Ok(event) => event,
                Err(_) => {
                    tracing::debug!(%peer, %host, "closing idle connection");
                    return Ok(());
                }
            };

            match event {
                Event::Upstream(Ok(0)) | Event::Upstream(Err(_)) => {
                    // Upstream finished or reset; propagate the close.
                    let _ = cw.shutdown().await;
                    return Ok(());
                }
                Event::Upstream(Ok(n)) => {
                    if cw.write_all(&ubuf[..n]).await.is_err() {
                        return Ok(());
                    }
                }
                Event::Client(Err(_)) => return Ok(()),
                Event::Client(Ok(0)) => {
                    // Client half-closed; flush the FIN upstream and keep
                    // draining the response until the upstream closes too.
                    client_open = false;
                    if let Some(w) = uw.as_mut() {
                        let _ = w.shutdown().await;
                    }
                }
                Event::Client(Ok(n)) => {
                    acc.extend_from_slice(&cbuf[..n]);
                    match self
                        .drain_client(&mut acc, &mut inbound, &mut ur, &mut uw, &mut cw, host, protocol, peer)
                        .await?
                    {
                        Flow::Continue => {}
                        Flow::Close => return Ok(()),
                    }
                }
            }
        }
    }

    /// Consumes whatever complete protocol units `acc` holds: request heads
    /// (evaluate, log, forward or reject) and framed body bytes (forward).
    #[allow(clippy::too_many_arguments)]
    async fn drain_client(
        &self,
        acc: &mut BytesMut,
        inbound: &mut Inbound,
        ur: &mut Option<ReadHalf<BoxedIo>>,
        uw: &mut Option<WriteHalf<BoxedIo>>,
        cw: &mut WriteHalf<BoxedIo>,
        host: &str,
        protocol: Protocol,
        peer: SocketAddr,
    ) -> ProxyResult<Flow> {
        loop {
            match inbound {
                Inbound::Head => {
                    let Some(end) = find_head_end(acc) else {
                        if acc.len() > MAX_HEAD {
                            return Err(HttpError::HeadTooLarge.into());
                        }
                        return Ok(Flow::Continue);
                    };

                    let head = parse_head(&acc[..end])?;
                    let snapshot = self.rules.current();

                    // SNI is authoritative for matching; a disagreeing Host
                    // header is recorded as a diagnostic only.
                    if protocol == Protocol::Tls {
                        if let Some(header_host) = head.host_header.as_deref() {
                            let bare = header_host.split(':').next().unwrap_or(header_host);
                            if !bare.eq_ignore_ascii_case(host) {
                                tracing::debug!(
                                    %peer,
                                    sni = %host,
                                    host_header = %header_host,
                                    "Host header differs from SNI"
                                );
                            }
                        }
                    }

                    match policy::evaluate(&snapshot, host, &head.target) {
                        Verdict::Block { reason } => {
                            self.traffic.record(TrafficEntry::new(
                                Action::Block,
                                snapshot.mode,
                                host,
                                &head.target,
                                &head.method,
                                &reason,
                            ));
                            tracing::info!(
                                %peer,
                                %host,
                                method = %head.method,
                                target = %head.target,
                                %reason,
                                "request blocked"
                            );
                            let _ = cw.write_all(&forbidden_response(&reason)).await;
                            let _ = cw.shutdown().await;
                            if let Some(w) = uw.as_mut() {
                                let _ = w.shutdown().await;
                            }
                            return Ok(Flow::Close);
                        }
                        Verdict::Allow { reason } => {
                            if uw.is_none() {
                                match self.open_upstream(protocol, host).await {
                                    Ok(upstream) => {
                                        let (r, w) = tokio::io::split(upstream);
                                        *ur = Some(r);
                                        *uw = Some(w);
                                    }
                                    Err(err) => {
                                        let reason = err.reason();
                                        self.traffic.record(TrafficEntry::new(
                                            Action::Block,
                                            snapshot.mode,
                                            host,
                                            &head.target,
                                            &head.method,
                                            &reason,
                                        ));
                                        tracing::warn!(%peer, %host, error = %err, "upstream unavailable");
                                        if protocol == Protocol::Http {
                                            let _ =
                                                cw.write_all(&bad_gateway_response(&reason)).await;
                                        }
                                        let _ = cw.shutdown().await;
                                        return Ok(Flow::Close);
                                    }
                                }
                            }

                            self.traffic.record(TrafficEntry::new(
                                Action::Allow,
                                snapshot.mode,
                                host,
                                &head.target,
                                &head.method,
                                &reason,
                            ));
                            tracing::debug!(
                                %peer,
                                %host,
                                method = %head.method,
                                target = %head.target,
                                %reason,
                                "request forwarded"
                            );

                            let head_bytes = acc.split_to(end);
                            if let Some(w) = uw.as_mut() {
                                if w.write_all(&head_bytes).await.is_err() {
                                    return Ok(Flow::Close);
                                }
                            }
                            *inbound = match head.framing {
                                BodyFraming::None => Inbound::Head,
                                framing => Inbound::Body(framing),
                            };
                        }
                    }
                }
                Inbound::Body(framing) => {
                    if acc.is_empty() {
                        return Ok(Flow::Continue);
                    }
                    let (consumed, done) = framing.advance(acc)?;
                    if consumed > 0 {
                        let chunk = acc.split_to(consumed);
                        if let Some(w) = uw.as_mut() {
                            if w.write_all(&chunk).await.is_err() {
                                return Ok(Flow::Close);
                            }
                        }
                    }
                    if done {
                        *inbound = Inbound::Head;
                    } else {
                        return Ok(Flow::Continue);
                    }
                }
            }
        }
    }
}

fn flatten_accept<T>(
    result: Result<std::io::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T, String> {
    match result {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(format!("Client Handshake Failed: {err}")),
        Err(_) => Err("Client Handshake Timeout".to_string()),
    }
}
