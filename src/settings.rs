//! INI-style node configuration.
//!
//! Keys resolve through a cascade, most specific first:
//! `service::command.key > service.key > command.key > Main.key`. Keys
//! prefixed `private::` and lines beginning `#!` never leave the node;
//! [`Settings::public_text`] is the copy safe to broadcast.

use std::{collections::BTreeMap, fs, io, path::Path};

const PRIVATE_PREFIX: &str = "private::";
const PRIVATE_COMMENT: &str = "#!";
const SCOPE_DELIMITER: &str = "::";

/// Parsed configuration plus the raw text it came from.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    raw: String,
}

impl Settings {
    /// Parses configuration text. Unparseable lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = "Main".to_string();

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
                current = name.trim().to_string();
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Self {
            sections,
            raw: text.to_string(),
        }
    }

    /// Reads and parses a configuration file.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Looks up `Section.key` verbatim, no cascade.
    pub fn get(&self, key: &str) -> Option<&str> {
        let (section, key) = key.rsplit_once('.')?;
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    /// String lookup with default, no cascade.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Integer lookup with default, no cascade.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Float lookup with default, no cascade.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Boolean lookup with default, no cascade. Accepts `1`/`0` and
    /// `true`/`false`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }

    fn cascade(&self, command: &str, service: &str, key: &str) -> Option<&str> {
        let mut result = self.get(&format!("Main.{key}"));
        if !command.is_empty() {
            result = self.get(&format!("{command}.{key}")).or(result);
        }
        if !service.is_empty() {
            result = self.get(&format!("{service}.{key}")).or(result);
            if !command.is_empty() {
                result = self
                    .get(&format!("{service}{SCOPE_DELIMITER}{command}.{key}"))
                    .or(result);
            }
        }
        result
    }

    /// Maximum fee the node accepts for a command.
    pub fn max_fee(&self, command: &str, service: &str, default: f64) -> f64 {
        self.cascade(command, service, "maxfee")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Reply timeout for a command, in seconds.
    pub fn command_timeout(&self, command: &str, service: &str, default: u64) -> u64 {
        self.cascade(command, service, "timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Consensus confirmation count for a command, floored at one. A
    /// caller-requested count above one takes precedence over the file.
    pub fn confirmations(&self, command: &str, service: &str, default: u64) -> u64 {
        if default > 1 {
            return default;
        }
        self.cascade(command, service, "consensus")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
            .max(1)
    }

    /// Fee charged for a command.
    pub fn command_fee(&self, command: &str, service: &str, default: f64) -> f64 {
        self.cascade(command, service, "fee")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Result-count cap for a command; negative values mean unlimited.
    pub fn fetch_limit(&self, command: &str, service: &str, default: i64) -> i64 {
        let limit = self
            .cascade(command, service, "fetchlimit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default);
        if limit < 0 {
            i64::MAX
        } else {
            limit
        }
    }

    /// Per-client request throttle for a command; negative means
    /// unlimited.
    pub fn client_request_limit(&self, command: &str, service: &str, default: i64) -> i64 {
        let limit = self
            .cascade(command, service, "clientrequestlimit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default);
        if limit < 0 {
            i64::MAX
        } else {
            limit
        }
    }

    /// Payment address advertised for fees.
    pub fn payment_address(&self, command: &str, service: &str) -> String {
        self.cascade(command, service, "paymentaddress")
            .unwrap_or_default()
            .to_string()
    }

    /// True when a command or service is switched off.
    pub fn disabled(&self, command: &str, service: &str) -> bool {
        matches!(
            self.cascade(command, service, "disabled"),
            Some("1") | Some("true")
        )
    }

    /// Node endpoint host. Scoped host entries are reserved; only
    /// `Main.host` is consulted.
    pub fn host(&self) -> String {
        self.get_str("Main.host", "")
    }

    /// Node endpoint port. Scoped port entries are reserved; only
    /// `Main.port` is consulted.
    pub fn port(&self, default: u16) -> u16 {
        self.get("Main.port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// The configuration text with every private entry removed, safe to
    /// hand to peers.
    pub fn public_text(&self) -> String {
        self.raw
            .lines()
            .filter(|line| {
                let trimmed = line.trim();
                if trimmed.starts_with(PRIVATE_COMMENT) {
                    return false;
                }
                match trimmed.split_once('=') {
                    Some((key, _)) => !key.trim().starts_with(PRIVATE_PREFIX),
                    None => true,
                }
            })
            .collect::<Vec<&str>>()
            .join("\n")
    }
}
