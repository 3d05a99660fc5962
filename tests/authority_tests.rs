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

//! Certificate authority contract tests: chain shape, signature algorithms,
//! validity windows, persistence, cache bounds, and mint coalescing.

use std::{fs, sync::Arc};

use secure_proxy::config::settings::CaSettings;
use secure_proxy::tls::authority::CertAuthority;
use tempfile::TempDir;
use x509_parser::prelude::*;

/// ecdsa-with-SHA256, the only signature OID the proxy may emit.
const ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";

fn ca_settings(dir: &TempDir) -> CaSettings {
    CaSettings {
        dir: dir.path().join("ca"),
        leaf_cache_capacity: 1024,
    }
}

fn open_authority(settings: &CaSettings) -> CertAuthority {
    CertAuthority::open(settings).expect("authority init")
}

#[test]
fn generates_and_persists_a_modern_root() {
    let dir = TempDir::new().unwrap();
    let settings = ca_settings(&dir);
    let _authority = open_authority(&settings);

    let cert_pem = fs::read(settings.cert_path()).expect("ca.pem written");
    assert!(settings.key_path().exists(), "ca.key written");

    let (_, pem) = x509_parser::pem::parse_x509_pem(&cert_pem).unwrap();
    let (_, cert) = parse_x509_certificate(&pem.contents).unwrap();

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(cn, "Secure Proxy CA");

    let bc = cert.basic_constraints().unwrap().expect("basic constraints");
    assert!(bc.value.ca, "root must assert CA:TRUE");

    let ku = cert.key_usage().unwrap().expect("key usage");
    assert!(ku.value.key_cert_sign());
    assert!(ku.value.crl_sign());

    assert_eq!(cert.signature_algorithm.algorithm.to_id_string(), ECDSA_WITH_SHA256);

    // Random 128-bit serial: far wider than a counter would produce.
    assert!(cert.serial.bits() > 64);
}

#[cfg(unix)]
#[test]
fn key_material_permissions_are_restrictive() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let settings = ca_settings(&dir);
    let _authority = open_authority(&settings);

    let key_mode = fs::metadata(settings.key_path()).unwrap().permissions().mode();
    assert_eq!(key_mode & 0o777, 0o600);
    let cert_mode = fs::metadata(settings.cert_path()).unwrap().permissions().mode();
    assert_eq!(cert_mode & 0o777, 0o644);
}

#[test]
fn reopen_loads_the_same_root() {
    let dir = TempDir::new().unwrap();
    let settings = ca_settings(&dir);

    let first = open_authority(&settings);
    let pem_before = fs::read(settings.cert_path()).unwrap();
    let first_pem = first.ca_cert_pem().to_string();
    drop(first);

    let second = open_authority(&settings);
    let pem_after = fs::read(settings.cert_path()).unwrap();

    assert_eq!(pem_before, pem_after, "reopen must not regenerate the root");
    assert_eq!(first_pem, second.ca_cert_pem());
}

#[test]
fn refuses_half_a_persisted_pair() {
    let dir = TempDir::new().unwrap();
    let settings = ca_settings(&dir);
    open_authority(&settings);

    fs::remove_file(settings.key_path()).unwrap();
    let err = CertAuthority::open(&settings).expect_err("stale cert without key");
    assert!(err.to_string().contains("both exist or both be absent"));
}

#[tokio::test]
async fn leaf_matches_the_contract() {
    let dir = TempDir::new().unwrap();
    let settings = ca_settings(&dir);
    let authority = open_authority(&settings);

    let leaf = authority.leaf_for("Example.COM").await.unwrap();
    assert_eq!(leaf.chain.len(), 2, "leaf then issuer");

    let (_, cert) = parse_x509_certificate(leaf.chain[0].as_ref()).unwrap();
    let (_, issuer) = parse_x509_certificate(leaf.chain[1].as_ref()).unwrap();

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(cn, "example.com", "hostname is normalized to lowercase");

    let san = cert
        .subject_alternative_name()
        .unwrap()
        .expect("SAN present");
    let dns_names: Vec<&str> = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(*dns),
            _ => None,
        })
        .collect();
    assert!(dns_names.contains(&"example.com"));
    assert!(dns_names.contains(&"www.example.com"));

    let bc = cert.basic_constraints().unwrap().expect("basic constraints");
    assert!(!bc.value.ca, "leaf must assert CA:FALSE");

    let ku = cert.key_usage().unwrap().expect("key usage");
    assert!(ku.value.digital_signature());
    assert!(ku.value.key_encipherment());

    let eku = cert.extended_key_usage().unwrap().expect("EKU");
    assert!(eku.value.server_auth);

    assert_eq!(cert.signature_algorithm.algorithm.to_id_string(), ECDSA_WITH_SHA256);

    // Validity covers now, backdated for clock skew, clamped to a year.
    let now = chrono::Utc::now().timestamp();
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    assert!(not_before <= now - 23 * 3600, "leaf is backdated ~24h");
    assert!(not_before >= now - 25 * 3600);
    assert!(not_after > now);
    assert!(not_after <= now + 366 * 24 * 3600);

    assert_eq!(
        cert.issuer().to_string(),
        issuer.subject().to_string(),
        "leaf chains to the bundled root"
    );
}

#[tokio::test]
async fn ip_hosts_get_ip_sans() {
    let dir = TempDir::new().unwrap();
    let authority = open_authority(&ca_settings(&dir));

    let leaf = authority.leaf_for("10.1.2.3").await.unwrap();
    let (_, cert) = parse_x509_certificate(leaf.chain[0].as_ref()).unwrap();
    let san = cert.subject_alternative_name().unwrap().expect("SAN");
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(_))));
}

#[tokio::test]
async fn concurrent_misses_coalesce_per_host() {
    let dir = TempDir::new().unwrap();
    let authority = Arc::new(open_authority(&ca_settings(&dir)));

    let hosts: Vec<String> = (0..10).map(|i| format!("host{i}.example")).collect();
    let mut tasks = Vec::new();
    for _ in 0..10 {
        for host in &hosts {
            let authority = Arc::clone(&authority);
            let host = host.clone();
            tasks.push(tokio::spawn(async move {
                authority.leaf_for(&host).await.unwrap()
            }));
        }
    }

    let mut leaves = Vec::new();
    for task in tasks {
        leaves.push(task.await.unwrap());
    }

    let metrics = authority.metrics();
    assert_eq!(
        metrics.minted, 10,
        "100 concurrent requests across 10 hosts mint exactly 10 leaves"
    );
    assert_eq!(metrics.hits + metrics.misses, 100);

    // Every request for the same host shares one cached leaf.
    let again = authority.leaf_for("host0.example").await.unwrap();
    let first = leaves
        .iter()
        .find(|leaf| {
            let (_, cert) = parse_x509_certificate(leaf.chain[0].as_ref()).unwrap();
            cert.subject().to_string().contains("host0.example")
        })
        .unwrap();
    assert!(Arc::ptr_eq(first, &again));
}

#[tokio::test]
async fn leaf_cache_is_lru_bounded() {
    let dir = TempDir::new().unwrap();
    let settings = CaSettings {
        dir: dir.path().join("ca"),
        leaf_cache_capacity: 2,
    };
    let authority = open_authority(&settings);

    authority.leaf_for("a.example").await.unwrap();
    authority.leaf_for("b.example").await.unwrap();
    authority.leaf_for("c.example").await.unwrap(); // evicts a.example
    assert_eq!(authority.metrics().minted, 3);

    authority.leaf_for("c.example").await.unwrap(); // still cached
    assert_eq!(authority.metrics().minted, 3);

    authority.leaf_for("a.example").await.unwrap(); // evicted, re-minted
    assert_eq!(authority.metrics().minted, 4);
}
