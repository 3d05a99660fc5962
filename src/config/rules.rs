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

//! Rules file model and snapshot store.
//!
//! The rules file is JSON with fields `mode` and `allowed_rules`; unknown
//! fields are ignored. The store publishes immutable [`RuleSet`] snapshots
//! through an atomic pointer swap: readers grab a cheap `Arc` reference and
//! keep evaluating against it even if a reload completes mid-request. A
//! failed reload never replaces the active snapshot.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::utils::error::{ProxyError, ProxyResult};

/// Enforcement mode. `allow-all` behaves like `monitor` with an empty rule
/// set: nothing is ever blocked, everything is still logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Monitor,
    Enforce,
    AllowAll,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Monitor => "monitor",
            Mode::Enforce => "enforce",
            Mode::AllowAll => "allow-all",
        }
    }

    /// Only `enforce` can produce Block verdicts.
    pub fn enforcing(self) -> bool {
        matches!(self, Mode::Enforce)
    }
}

/// One allowlist entry. Matches a request host `H` when `H == host` or `H`
/// ends with `"." + host` (suffix on a DNS label boundary). An empty
/// `allowed_paths` means any path is allowed.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRule {
    pub host: String,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

/// Immutable snapshot of the active rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub mode: Mode,
    pub rules: Vec<HostRule>,
}

impl Default for RuleSet {
    /// Built-in fallback when no valid rules file is available.
    fn default() -> Self {
        Self {
            mode: Mode::Monitor,
            rules: Vec::new(),
        }
    }
}

/// Raw deserialization target; validation happens in [`RuleSet::parse`].
#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default = "default_mode")]
    mode: Mode,
    #[serde(default)]
    allowed_rules: Vec<HostRule>,
}

fn default_mode() -> Mode {
    Mode::Monitor
}

impl RuleSet {
    /// Parses and validates a rules file. Hosts must be non-empty and every
    /// listed path must begin with `/`. `allow-all` collapses to the fixed
    /// never-block snapshot regardless of any rules present.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let file: RulesFile = serde_json::from_str(raw).map_err(|e| e.to_string())?;

        for rule in &file.allowed_rules {
            if rule.host.trim().is_empty() {
                return Err("rule with empty host".into());
            }
            for path in &rule.allowed_paths {
                if !path.starts_with('/') {
                    return Err(format!(
                        "path {:?} for host {:?} must begin with '/'",
                        path, rule.host
                    ));
                }
            }
        }

        let rules = if file.mode == Mode::AllowAll {
            Vec::new()
        } else {
            file.allowed_rules
        };

        Ok(Self {
            mode: file.mode,
            rules,
        })
    }
}

/// Snapshot store over the rules file.
pub struct RuleStore {
    path: PathBuf,
    snapshot: ArcSwap<RuleSet>,
}

impl RuleStore {
    /// Loads the rules file at startup. A missing or invalid file degrades to
    /// the built-in Monitor/empty default with a diagnostic; it is not fatal.
    pub fn open(path: PathBuf) -> Self {
        let initial = match Self::load_file(&path) {
            Ok(rules) => {
                tracing::info!(
                    path = %path.display(),
                    mode = rules.mode.as_str(),
                    rule_count = rules.rules.len(),
                    "rules loaded"
                );
                rules
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    "no usable rules file ({err}), starting in monitor mode"
                );
                RuleSet::default()
            }
        };

        Self {
            path,
            snapshot: ArcSwap::from_pointee(initial),
        }
    }

    /// Current snapshot. Non-blocking; callers hold the `Arc` for the
    /// lifetime of the request they are evaluating.
    pub fn current(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    /// Re-reads the rules file and atomically publishes the new snapshot.
    /// On any failure the previous snapshot stays active.
    pub fn reload(&self) -> ProxyResult<()> {
        let rules = Self::load_file(&self.path).map_err(|detail| ProxyError::Rules {
            path: self.path.display().to_string(),
            detail,
        })?;
        tracing::info!(
            path = %self.path.display(),
            mode = rules.mode.as_str(),
            rule_count = rules.rules.len(),
            "rules reloaded"
        );
        self.snapshot.store(Arc::new(rules));
        Ok(())
    }

    fn load_file(path: &Path) -> Result<RuleSet, String> {
        let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
        RuleSet::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_and_rules() {
        let rules = RuleSet::parse(
            r#"{"mode":"enforce","allowed_rules":[{"host":"github.com","allowed_paths":["/repos/"]}]}"#,
        )
        .unwrap();
        assert_eq!(rules.mode, Mode::Enforce);
        assert_eq!(rules.rules.len(), 1);
        assert_eq!(rules.rules[0].allowed_paths, vec!["/repos/"]);
    }

    #[test]
    fn missing_fields_default_to_monitor() {
        let rules = RuleSet::parse("{}").unwrap();
        assert_eq!(rules.mode, Mode::Monitor);
        assert!(rules.rules.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let rules = RuleSet::parse(r#"{"mode":"monitor","comment":"x","allowed_rules":[]}"#);
        assert!(rules.is_ok());
    }

    #[test]
    fn allow_all_drops_rules() {
        let rules = RuleSet::parse(
            r#"{"mode":"allow-all","allowed_rules":[{"host":"github.com"}]}"#,
        )
        .unwrap();
        assert_eq!(rules.mode, Mode::AllowAll);
        assert!(rules.rules.is_empty());
        assert!(!rules.mode.enforcing());
    }

    #[test]
    fn rejects_empty_host_and_relative_paths() {
        assert!(RuleSet::parse(r#"{"allowed_rules":[{"host":""}]}"#).is_err());
        assert!(RuleSet::parse(
            r#"{"allowed_rules":[{"host":"a.com","allowed_paths":["repos"]}]}"#
        )
        .is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(RuleSet::parse(r#"{"mode":"audit"}"#).is_err());
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{"mode":"enforce","allowed_rules":[{"host":"a.com"}]}"#).unwrap();

        let store = RuleStore::open(path.clone());
        assert_eq!(store.current().mode, Mode::Enforce);

        fs::write(&path, "not json").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.current().mode, Mode::Enforce);
        assert_eq!(store.current().rules.len(), 1);
    }

    #[test]
    fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{"mode":"enforce","allowed_rules":[{"host":"a.com"}]}"#).unwrap();

        let store = RuleStore::open(path.clone());
        let held = store.current();

        fs::write(&path, r#"{"mode":"monitor"}"#).unwrap();
        store.reload().unwrap();

        // The in-flight reference still sees the snapshot it started with.
        assert_eq!(held.mode, Mode::Enforce);
        assert_eq!(store.current().mode, Mode::Monitor);
    }
}
