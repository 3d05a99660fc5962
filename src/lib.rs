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

//! Transparent intercepting HTTPS proxy.
//!
//! Connections from a sandboxed workload destined for remote ports 80/443
//! are redirected to this proxy's listener. Each one is classified by its
//! first bytes (TLS or plaintext HTTP), the target hostname is recovered
//! from the ClientHello SNI or the Host header, TLS is terminated with a
//! per-host leaf minted by an in-process CA and re-originated upstream with
//! real certificate validation, and every HTTP request is checked against a
//! host/path allowlist and recorded in an append-only JSONL traffic log.

pub mod app;
pub mod config;
pub mod policy;
pub mod proxy;
pub mod tls;
pub mod traffic;
pub mod utils;
