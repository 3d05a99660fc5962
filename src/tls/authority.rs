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

//! In-process certificate authority.
//!
//! On first start a self-signed ECDSA P-256 root is generated and persisted
//! (key 0600, certificate 0644, both written tmp + rename; the certificate
//! lands last because external entrypoints treat its appearance as the
//! readiness signal). Subsequent starts load the persisted pair. Concurrent
//! first starts serialise through a `create_new` lock file.
//!
//! Leaf certificates are minted on demand per SNI hostname, cached in a
//! bounded LRU, and coalesced per host so concurrent misses for the same
//! name produce exactly one signing operation.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    io::Write,
    net::IpAddr,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration as StdDuration,
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use dashmap::DashMap;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ServerConfig,
};
use time::{Duration, OffsetDateTime};

use crate::{
    config::settings::CaSettings,
    utils::error::{ProxyError, ProxyResult},
};

const CA_COMMON_NAME: &str = "Secure Proxy CA";
const CA_ORGANIZATION: &str = "Secure Proxy";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Leaves are backdated to tolerate client clock skew.
const LEAF_BACKDATE_HOURS: i64 = 24;
/// How long a racing start waits for the winner to publish the CA pair.
const LOCK_WAIT: StdDuration = StdDuration::from_secs(15);

/// A minted, cache-ready leaf identity for one hostname.
#[derive(Debug)]
pub struct MintedLeaf {
    /// Ready-to-serve rustls config presenting `chain`.
    pub server_config: Arc<ServerConfig>,
    /// Leaf certificate first, root second.
    pub chain: Vec<CertificateDer<'static>>,
    /// notAfter of the leaf; expired entries are treated as cache misses.
    pub expires_at: OffsetDateTime,
}

/// Cache counters, exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub minted: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    minted: AtomicU64,
}

#[derive(Debug)]
struct LeafCache {
    entries: HashMap<String, Arc<MintedLeaf>>,
    order: VecDeque<String>,
}

/// Process-singleton issuer. Read-only after init apart from the leaf cache.
#[derive(Debug)]
pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    ca_not_after: OffsetDateTime,
    cache: Mutex<LeafCache>,
    capacity: usize,
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    stats: CacheStats,
}

impl CertAuthority {
    /// Loads the persisted root or generates a fresh one.
    ///
    /// Blocking (filesystem + key generation); call from startup or through
    /// `spawn_blocking`. Any failure here is fatal per the error contract.
    pub fn open(settings: &CaSettings) -> ProxyResult<Self> {
        let cert_path = settings.cert_path();
        let key_path = settings.key_path();

        prepare_dir(cert_path.parent(), 0o755)?;
        prepare_dir(key_path.parent(), 0o700)?;

        // Refuse to regenerate over half a pair: silently replacing ca.pem
        // would invalidate trust stores that already installed it.
        let have_cert = cert_path.exists();
        let have_key = key_path.exists();
        if have_cert != have_key {
            return Err(ProxyError::CaInit(format!(
                "CA certificate and key must both exist or both be absent \
                 (cert: {have_cert}, key: {have_key}); remove the stale file and restart"
            )));
        }

        let root = if have_cert {
            RootMaterial::load(&cert_path, &key_path)?
        } else {
            generate_under_lock(&settings.dir, &cert_path, &key_path)?
        };

        tracing::info!(
            cert = %cert_path.display(),
            not_after = %root.not_after,
            "certificate authority ready"
        );

        Ok(Self {
            issuer: root.issuer,
            ca_cert_der: root.cert_der,
            ca_cert_pem: root.cert_pem,
            ca_not_after: root.not_after,
            cache: Mutex::new(LeafCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: settings.leaf_cache_capacity.max(1),
            gates: DashMap::new(),
            stats: CacheStats::default(),
        })
    }

    /// PEM of the root certificate (what external trust stores install).
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            minted: self.stats.minted.load(Ordering::Relaxed),
        }
    }

    /// Returns the cached or freshly minted leaf for `host`.
    ///
    /// Concurrent callers for the same host coalesce on a per-host gate: one
    /// caller mints while the rest wait and then share the cached result.
    pub async fn leaf_for(&self, host: &str) -> ProxyResult<Arc<MintedLeaf>> {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();

        if let Some(hit) = self.cache_get(&host) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let gate = self
            .gates
            .entry(host.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another task may have minted while we waited on the gate.
        if let Some(hit) = self.cache_get(&host) {
            return Ok(hit);
        }

        let leaf = Arc::new(self.mint(&host)?);
        self.stats.minted.fetch_add(1, Ordering::Relaxed);
        self.cache_insert(&host, leaf.clone());
        tracing::debug!(%host, "minted leaf certificate");

        drop(_guard);
        self.gates.remove(&host);
        Ok(leaf)
    }

    fn cache_get(&self, host: &str) -> Option<Arc<MintedLeaf>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let now = OffsetDateTime::now_utc();
        let fresh = match cache.entries.get(host) {
            Some(leaf) if leaf.expires_at > now => Some(leaf.clone()),
            Some(_) => None, // expired
            None => return None,
        };
        match fresh {
            Some(leaf) => {
                touch(&mut cache.order, host);
                Some(leaf)
            }
            None => {
                cache.entries.remove(host);
                if let Some(pos) = cache.order.iter().position(|k| k == host) {
                    cache.order.remove(pos);
                }
                None
            }
        }
    }

    fn cache_insert(&self, host: &str, leaf: Arc<MintedLeaf>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        while cache.entries.len() >= self.capacity {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.entries.remove(&oldest);
                }
                None => break,
            }
        }
        cache.entries.insert(host.to_string(), leaf);
        touch(&mut cache.order, host);
    }

    /// Builds and signs a leaf for `host` under the root key.
    fn mint(&self, host: &str) -> ProxyResult<MintedLeaf> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        let not_after = (now + Duration::days(LEAF_VALIDITY_DAYS)).min(self.ca_not_after);
        params.not_before = now - Duration::hours(LEAF_BACKDATE_HOURS);
        params.not_after = not_after;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params.subject_alt_names.push(SanType::DnsName(host.try_into()?));
            if let Some(alias) = www_alias(host) {
                params
                    .subject_alt_names
                    .push(SanType::DnsName(alias.as_str().try_into()?));
            }
        }

        let cert = params.signed_by(&key, &self.issuer)?;
        let chain = vec![cert.der().clone(), self.ca_cert_der.clone()];
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(MintedLeaf {
            server_config: Arc::new(config),
            chain,
            expires_at: not_after,
        })
    }
}

/// `www.`-twin of the hostname, when one makes sense.
fn www_alias(host: &str) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    if let Some(bare) = host.strip_prefix("www.") {
        if bare.contains('.') {
            return Some(bare.to_string());
        }
        return None;
    }
    if host.contains('.') {
        return Some(format!("www.{host}"));
    }
    None
}

fn touch(order: &mut VecDeque<String>, host: &str) {
    if let Some(pos) = order.iter().position(|k| k == host) {
        order.remove(pos);
    }
    order.push_back(host.to_string());
}

/// Random 128-bit serial with the top bit cleared so the DER integer stays
/// positive.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    not_after: OffsetDateTime,
}

impl RootMaterial {
    fn load(cert_path: &Path, key_path: &Path) -> ProxyResult<Self> {
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| ProxyError::CaInit(format!("read {}: {e}", key_path.display())))?;
        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::CaInit(format!("parse {}: {e}", key_path.display())))?;

        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| ProxyError::CaInit(format!("read {}: {e}", cert_path.display())))?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| ProxyError::CaInit(format!("parse {}: {e}", cert_path.display())))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(&pem.contents)
            .map_err(|e| ProxyError::CaInit(format!("parse {}: {e}", cert_path.display())))?;
        let not_after = OffsetDateTime::from_unix_timestamp(parsed.validity().not_after.timestamp())
            .map_err(|e| ProxyError::CaInit(format!("CA notAfter out of range: {e}")))?;

        let cert_der = CertificateDer::from(pem.contents.clone());
        let issuer = Issuer::from_ca_cert_der(&cert_der, key)
            .map_err(|e| ProxyError::CaInit(format!("rebuild issuer: {e}")))?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            not_after,
        })
    }

    fn generate(cert_path: &Path, key_path: &Path) -> ProxyResult<Self> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        let not_after = params.not_after;

        let cert = params.clone().self_signed(&key)?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        let key_pem = key.serialize_pem();

        // Key first, certificate last: ca.pem appearing is the external
        // readiness signal and must never precede a usable key.
        atomic_write(key_path, key_pem.as_bytes(), 0o600)?;
        atomic_write(cert_path, cert_pem.as_bytes(), 0o644)?;

        let issuer = Issuer::new(params, key);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            not_after,
        })
    }
}

/// Generates the root while holding the startup lock file, or waits for a
/// concurrent generator and loads its output.
fn generate_under_lock(
    ca_dir: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> ProxyResult<RootMaterial> {
    let lock_path = ca_dir.join(".ca.lock");

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(_) => {
            // Re-check under the lock: a previous holder may have finished
            // between our existence check and acquisition.
            let result = if cert_path.exists() && key_path.exists() {
                RootMaterial::load(cert_path, key_path)
            } else {
                tracing::info!("generating certificate authority");
                RootMaterial::generate(cert_path, key_path)
            };
            let _ = fs::remove_file(&lock_path);
            result
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let deadline = std::time::Instant::now() + LOCK_WAIT;
            while std::time::Instant::now() < deadline {
                if cert_path.exists() && key_path.exists() {
                    return RootMaterial::load(cert_path, key_path);
                }
                std::thread::sleep(StdDuration::from_millis(100));
            }
            Err(ProxyError::CaInit(format!(
                "timed out waiting for concurrent CA generation (lock {})",
                lock_path.display()
            )))
        }
        Err(err) => Err(ProxyError::CaInit(format!(
            "create lock {}: {err}",
            lock_path.display()
        ))),
    }
}

fn prepare_dir(dir: Option<&Path>, mode: u32) -> ProxyResult<()> {
    let Some(dir) = dir else { return Ok(()) };
    fs::create_dir_all(dir).map_err(|e| ProxyError::CaInit(format!("{}: {e}", dir.display())))?;
    #[cfg(unix)]
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
        .map_err(|e| ProxyError::CaInit(format!("{}: {e}", dir.display())))?;
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Write-to-tmp then rename so watchers never observe a partial file.
fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> ProxyResult<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        let mut tmp = options
            .open(&tmp_path)
            .map_err(|e| ProxyError::CaInit(format!("{}: {e}", tmp_path.display())))?;
        tmp.write_all(contents)
            .map_err(|e| ProxyError::CaInit(format!("{}: {e}", tmp_path.display())))?;
        tmp.sync_all()
            .map_err(|e| ProxyError::CaInit(format!("{}: {e}", tmp_path.display())))?;
    }
    fs::rename(&tmp_path, path)
        .map_err(|e| ProxyError::CaInit(format!("{}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn www_alias_pairs_hosts() {
        assert_eq!(www_alias("github.com").as_deref(), Some("www.github.com"));
        assert_eq!(www_alias("www.github.com").as_deref(), Some("github.com"));
        assert_eq!(www_alias("localhost"), None);
        assert_eq!(www_alias("www.x"), None);
        assert_eq!(www_alias("10.0.0.1"), None);
    }

    #[test]
    fn serials_are_positive_and_distinct() {
        let a = random_serial();
        let b = random_serial();
        assert_ne!(a, b);
        assert!(a.as_ref()[0] & 0x80 == 0);
    }
}
