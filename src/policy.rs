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

//! Rule evaluation over an immutable snapshot.
//!
//! Host comparison is ASCII case-insensitive and suffix matches only on DNS
//! label boundaries (`evil-github.com` does not match a `github.com` rule).
//! Path comparison is a literal byte prefix over the request target including
//! any query string; no normalisation is applied. The first matching rule in
//! declaration order wins.

use crate::config::rules::{HostRule, RuleSet};

/// Outcome of evaluating one request against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow { reason: String },
    Block { reason: String },
}

impl Verdict {
    fn allow(reason: impl Into<String>) -> Self {
        Verdict::Allow {
            reason: reason.into(),
        }
    }

    fn block(reason: impl Into<String>) -> Self {
        Verdict::Block {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Allow { reason } | Verdict::Block { reason } => reason,
        }
    }
}

/// Evaluates `(host, path)` against the snapshot.
pub fn evaluate(rules: &RuleSet, host: &str, path: &str) -> Verdict {
    if !rules.mode.enforcing() {
        return Verdict::allow("Monitor Mode");
    }

    let Some(rule) = find_rule(rules, host) else {
        return Verdict::block("Host Not Allowed");
    };

    if rule.allowed_paths.is_empty() {
        return Verdict::allow("Host Match");
    }

    if rule.allowed_paths.iter().any(|p| path.starts_with(p.as_str())) {
        return Verdict::allow("Path Match");
    }

    Verdict::block(format!("Path Not Allowed: {:?}", rule.allowed_paths))
}

/// Host-level precheck: can any request to `host` possibly be allowed under
/// this snapshot? Used before dialing upstream so that a host with no
/// matching rule never triggers an outbound connection.
pub fn host_permitted(rules: &RuleSet, host: &str) -> bool {
    !rules.mode.enforcing() || find_rule(rules, host).is_some()
}

fn find_rule<'a>(rules: &'a RuleSet, host: &str) -> Option<&'a HostRule> {
    rules.rules.iter().find(|rule| host_matches(host, &rule.host))
}

fn host_matches(host: &str, rule_host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let rule_host = rule_host.to_ascii_lowercase();
    host == rule_host || host.ends_with(&format!(".{rule_host}"))
}
