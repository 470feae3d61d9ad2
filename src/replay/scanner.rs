//! Command-injection scanning by parameter mutation.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use super::{header_is_replayed, Replayer};
use crate::capture::{ParamClass, Request};

/// Message reported by a scan that found nothing.
pub const ALL_GOOD: &str = "all good";

/// One attack: a payload appended to a parameter value, and the marker whose
/// presence in the replayed body means the payload was executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub payload: String,
    pub marker: String,
}

impl Signature {
    pub fn new(payload: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            marker: marker.into(),
        }
    }

    /// Shell payloads that print `/etc/passwd` when interpreted.
    pub fn command_injection_defaults() -> Vec<Self> {
        vec![
            Signature::new(";cat /etc/passwd;", "root:"),
            Signature::new("|cat /etc/passwd|", "root:"),
            Signature::new("`cat /etc/passwd`", "root:"),
        ]
    }
}

/// A parameter that reflected command output for a given payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub class: ParamClass,
    pub key: String,
    pub payload: String,
    pub marker: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter '{}' ({}) is vulnerable to command injection with payload '{}'",
            self.key, self.class, self.payload
        )
    }
}

/// Outcome of scanning one request. Finding order carries no meaning.
///
/// Serializes with a `messages` field alongside the raw counts, so JSON
/// consumers see the same lines (including [`ALL_GOOD`]) as the CLI prints.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
    pub attempts: usize,
    pub failed_attempts: usize,
    /// Header keys left out because replay rebuilds or drops them.
    pub skipped_keys: Vec<String>,
}

impl Serialize for ScanReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ScanReport", 5)?;
        state.serialize_field("messages", &self.messages())?;
        state.serialize_field("findings", &self.findings)?;
        state.serialize_field("attempts", &self.attempts)?;
        state.serialize_field("failed_attempts", &self.failed_attempts)?;
        state.serialize_field("skipped_keys", &self.skipped_keys)?;
        state.end()
    }
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Human-readable lines: one per finding, or exactly [`ALL_GOOD`].
    pub fn messages(&self) -> Vec<String> {
        if self.findings.is_empty() {
            return vec![ALL_GOOD.to_string()];
        }
        self.findings.iter().map(|f| f.to_string()).collect()
    }
}

/// Drives the [`Replayer`] over every parameter × signature mutation.
pub struct Scanner {
    replayer: Replayer,
    signatures: Vec<Signature>,
}

impl Scanner {
    pub fn new(replayer: Replayer, signatures: Vec<Signature>) -> Self {
        Self {
            replayer,
            signatures,
        }
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Scan `original` sequentially. Each attempt replays a fresh clone with
    /// one payload appended to one key; `original` is never modified.
    /// Failed replays are logged and skipped.
    pub async fn scan(&self, original: &Request) -> ScanReport {
        let mut report = ScanReport::default();

        for class in ParamClass::ALL {
            for key in original.params(class).keys() {
                // A mutation replay would drop can never show up in a response
                if class == ParamClass::Headers && !header_is_replayed(original, key) {
                    tracing::debug!(key = %key, "Skipping header that replay does not send");
                    report.skipped_keys.push(key.clone());
                    continue;
                }

                for signature in &self.signatures {
                    let attempt = original.with_appended(class, key, &signature.payload);
                    report.attempts += 1;

                    let body = match self.replayer.replay(&attempt).await {
                        Ok(body) => body,
                        Err(e) => {
                            report.failed_attempts += 1;
                            tracing::debug!(
                                class = %class,
                                key = %key,
                                payload = %signature.payload,
                                error = %e,
                                "Scan attempt failed"
                            );
                            continue;
                        }
                    };

                    if body.contains(&signature.marker) {
                        tracing::warn!(
                            class = %class,
                            key = %key,
                            payload = %signature.payload,
                            "Command injection detected"
                        );
                        report.findings.push(Finding {
                            class,
                            key: key.clone(),
                            payload: signature.payload.clone(),
                            marker: signature.marker.clone(),
                        });
                    }
                }
            }
        }

        tracing::info!(
            path = %original.path,
            attempts = report.attempts,
            failed = report.failed_attempts,
            findings = report.findings.len(),
            "Scan finished"
        );
        report
    }
}
