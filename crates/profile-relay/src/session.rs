// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session identifiers and the correlation label injected into relayed profile keys.
//!
//! A profile upload names its series with a key of the form `app.name{label=value,...}` carried
//! in the `name` query parameter. Every upload relayed by one extension instance is tagged with
//! the same session label so the backend can group profiles from the same sandbox.

use fnv::FnvHasher;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::hash::Hasher;
use std::sync::{Mutex, PoisonError};
use tracing::warn;
use url::form_urlencoded;

/// Reserved label key carrying the session identifier.
pub const SESSION_LABEL: &str = "__session_id__";

const NAME_QUERY_KEY: &str = "name";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(value: u64) -> Self {
        SessionId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_le_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Where a session id generator takes its seed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeedSource {
    /// Seeded from a hash of the host's network identity, so restarts on the same host
    /// produce the same sequence.
    Host(String),
    /// Seeded from the operating system's random source.
    Random,
}

impl SeedSource {
    /// Uses the `HOSTNAME` environment variable, then the system hostname, and falls back
    /// to a random seed when neither is available.
    pub fn detect() -> Self {
        if let Ok(hostname) = env::var("HOSTNAME") {
            if !hostname.is_empty() {
                return SeedSource::Host(hostname);
            }
        }
        match nix::unistd::gethostname() {
            Ok(hostname) => match hostname.to_str() {
                Some(hostname) if !hostname.is_empty() => SeedSource::Host(hostname.to_string()),
                _ => SeedSource::Random,
            },
            Err(e) => {
                warn!("Failed to get system hostname, using a random session seed: {e}");
                SeedSource::Random
            }
        }
    }
}

fn host_seed(host: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(host.as_bytes());
    hasher.finish()
}

/// Produces session identifiers. Owned by whoever assembles the process and passed down
/// explicitly; there is no process-wide instance.
pub struct SessionIdGenerator {
    rng: Mutex<StdRng>,
}

impl SessionIdGenerator {
    pub fn new(seed: &SeedSource) -> Self {
        let rng = match seed {
            SeedSource::Host(host) => StdRng::seed_from_u64(host_seed(host)),
            SeedSource::Random => StdRng::from_entropy(),
        };
        SessionIdGenerator {
            rng: Mutex::new(rng),
        }
    }

    pub fn next_id(&self) -> SessionId {
        let mut bytes = [0u8; 8];
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(&mut bytes);
        SessionId(u64::from_le_bytes(bytes))
    }
}

/// First identifier drawn from a generator seeded by `seed`. Deterministic for
/// [`SeedSource::Host`].
pub fn generate(seed: &SeedSource) -> SessionId {
    SessionIdGenerator::new(seed).next_id()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("profile key has an empty application name")]
    EmptyName,
    #[error("invalid character {0:?} in application name")]
    InvalidName(char),
    #[error("profile key has an unterminated label set")]
    UnterminatedLabels,
    #[error("malformed label {0:?}")]
    MalformedLabel(String),
    #[error("duplicate label {0:?}")]
    DuplicateLabel(String),
}

/// A parsed `app.name{key=value,...}` profile key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileKey {
    name: String,
    labels: BTreeMap<String, String>,
}

impl ProfileKey {
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let key = key.trim();
        let (name, labels) = match key.find('{') {
            None => (key, ""),
            Some(start) => {
                let rest = &key[start + 1..];
                let inner = rest.strip_suffix('}').ok_or(KeyError::UnterminatedLabels)?;
                (&key[..start], inner)
            }
        };

        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(KeyError::InvalidName(c));
        }

        let mut parsed = BTreeMap::new();
        for pair in labels.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| KeyError::MalformedLabel(pair.to_string()))?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || k.contains(['{', '}']) || v.contains(['{', '}']) {
                return Err(KeyError::MalformedLabel(pair.to_string()));
            }
            if parsed.insert(k.to_string(), v.to_string()).is_some() {
                return Err(KeyError::DuplicateLabel(k.to_string()));
            }
        }

        Ok(ProfileKey {
            name: name.to_string(),
            labels: parsed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Adds a label unless one with the same key is already present.
    /// Returns whether the key changed.
    pub fn add_if_absent(&mut self, key: &str, value: &str) -> bool {
        if self.labels.contains_key(key) {
            return false;
        }
        self.labels.insert(key.to_string(), value.to_string());
        true
    }

    /// Canonical form with labels sorted by key.
    pub fn normalized(&self) -> String {
        let labels = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{labels}}}", self.name)
    }
}

/// Rewrites the `name` parameter of a raw query string so its profile key carries the
/// session label. Pairs other than `name` are kept byte for byte and in order. A query whose
/// key is missing or does not parse is returned unchanged; the backend decides what to do
/// with it.
pub fn inject_label(query: &str, session_id: &str) -> String {
    let mut rewritten = false;
    let pairs = query
        .split('&')
        .map(|pair| {
            if rewritten {
                return pair.to_string();
            }
            match rewrite_name_pair(pair, session_id) {
                Some(updated) => {
                    rewritten = true;
                    updated
                }
                None => pair.to_string(),
            }
        })
        .collect::<Vec<_>>();
    pairs.join("&")
}

fn rewrite_name_pair(pair: &str, session_id: &str) -> Option<String> {
    let (key, value) = form_urlencoded::parse(pair.as_bytes()).next()?;
    if key != NAME_QUERY_KEY {
        return None;
    }
    let mut profile_key = ProfileKey::parse(&value).ok()?;
    if !profile_key.add_if_absent(SESSION_LABEL, session_id) {
        return None;
    }
    Some(
        form_urlencoded::Serializer::new(String::new())
            .append_pair(NAME_QUERY_KEY, &profile_key.normalized())
            .finish(),
    )
}
