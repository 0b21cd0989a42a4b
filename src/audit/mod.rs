//! Tamper-evident audit trail.
//!
//! Every entry is signed with HMAC-SHA256 over its canonical JSON form, its sequence
//! number and the previous entry's signature, so editing, dropping or reordering any
//! stored row breaks verification from that row onwards.

pub mod sink;

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::error::AuditError;

pub use sink::{AuditSink, MemoryAuditSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: JsonValue,
    pub signature: String,
}

/// An action to record, before it is sequenced and signed.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: JsonValue,
}

impl AuditEvent {
    /// An action taken by the service itself.
    pub fn system(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            user_id: None,
            action: action.into(),
            resource: resource.into(),
            method: "SYSTEM".to_string(),
            path: String::new(),
            status_code: 200,
            ip_address: None,
            user_agent: None,
            details: JsonValue::Null,
        }
    }

    pub fn by_user(
        mut self,
        user_id: impl Into<String>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        self.user_id = Some(user_id.into());
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    pub fn request(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = method.into();
        self.path = path.into();
        self
    }

    pub fn status(mut self, status_code: i32) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

/// Result of walking the chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainVerification {
    pub entries_checked: usize,
    pub first_broken: Option<BrokenLink>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokenLink {
    pub sequence: i64,
    pub reason: String,
}

struct ChainHead {
    sequence: i64,
    signature: String,
}

pub struct AuditTrail {
    key: hmac::Key,
    sink: Arc<dyn AuditSink>,
    // Single append lane: sequencing, chaining and the sink write happen under it.
    head: Mutex<ChainHead>,
}

impl AuditTrail {
    /// Open the trail on `sink`, continuing from its last entry.
    pub async fn open(hmac_key: &str, sink: Arc<dyn AuditSink>) -> Result<Self, AuditError> {
        let last = sink.last().await.map_err(AuditError::Sink)?;
        let head = match last {
            Some(entry) => {
                tracing::info!(sequence = entry.sequence, "Resuming audit chain");
                ChainHead {
                    sequence: entry.sequence,
                    signature: entry.signature,
                }
            }
            None => ChainHead {
                sequence: 0,
                signature: String::new(),
            },
        };
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, hmac_key.as_bytes()),
            sink,
            head: Mutex::new(head),
        })
    }

    pub async fn log(&self, event: AuditEvent) -> Result<AuditLogEntry, AuditError> {
        let mut entry = AuditLogEntry {
            sequence: 0,
            // Postgres keeps microseconds; anything finer would not survive a round trip.
            timestamp: Utc::now().trunc_subsecs(6),
            user_id: event.user_id,
            action: event.action,
            resource: event.resource,
            method: event.method,
            path: event.path,
            status_code: event.status_code,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            details: event.details,
            signature: String::new(),
        };
        let canonical = canonicalize(&entry)?;

        let mut head = self.head.lock().await;
        entry.sequence = head.sequence + 1;
        entry.signature = self.sign(entry.sequence, &canonical, &head.signature);
        self.sink.append(&entry).await.map_err(AuditError::Sink)?;
        head.sequence = entry.sequence;
        head.signature = entry.signature.clone();
        drop(head);

        tracing::debug!(
            sequence = entry.sequence,
            action = %entry.action,
            resource = %entry.resource,
            "Audit entry recorded"
        );
        Ok(entry)
    }

    fn sign(&self, sequence: i64, canonical: &str, previous: &str) -> String {
        let mut ctx = hmac::Context::with_key(&self.key);
        ctx.update(sequence.to_string().as_bytes());
        ctx.update(b"|");
        ctx.update(canonical.as_bytes());
        ctx.update(b"|");
        ctx.update(previous.as_bytes());
        hex::encode(ctx.sign().as_ref())
    }

    /// Walk the sink in order and report the first entry whose link does not hold.
    pub async fn verify(&self) -> Result<ChainVerification, AuditError> {
        let entries = self.sink.entries().await.map_err(AuditError::Sink)?;

        let mut previous_signature = "";
        let mut previous_sequence = 0i64;
        for (checked, entry) in entries.iter().enumerate() {
            let broken = |reason: &str| ChainVerification {
                entries_checked: checked + 1,
                first_broken: Some(BrokenLink {
                    sequence: entry.sequence,
                    reason: reason.to_string(),
                }),
            };

            if entry.sequence != previous_sequence + 1 {
                return Ok(broken("sequence gap"));
            }
            let canonical = canonicalize(entry)?;
            let mut message = Vec::new();
            message.extend_from_slice(entry.sequence.to_string().as_bytes());
            message.push(b'|');
            message.extend_from_slice(canonical.as_bytes());
            message.push(b'|');
            message.extend_from_slice(previous_signature.as_bytes());

            let valid = hex::decode(&entry.signature)
                .map(|tag| hmac::verify(&self.key, &message, &tag).is_ok())
                .unwrap_or(false);
            if !valid {
                return Ok(broken("signature mismatch"));
            }

            previous_signature = &entry.signature;
            previous_sequence = entry.sequence;
        }

        Ok(ChainVerification {
            entries_checked: entries.len(),
            first_broken: None,
        })
    }

    /// `verify`, turning a break into an error and an error-level log line.
    pub async fn verify_or_alarm(&self) -> Result<ChainVerification, AuditError> {
        let verification = self.verify().await?;
        if let Some(broken) = &verification.first_broken {
            tracing::error!(
                sequence = broken.sequence,
                reason = %broken.reason,
                "Audit chain verification failed"
            );
            return Err(AuditError::ChainBroken {
                sequence: broken.sequence,
                reason: broken.reason.clone(),
            });
        }
        tracing::info!(entries = verification.entries_checked, "Audit chain verified");
        Ok(verification)
    }
}

/// Sorted-key JSON of every field except `sequence` and `signature`.
fn canonicalize(entry: &AuditLogEntry) -> Result<String, AuditError> {
    let mut value = serde_json::to_value(entry)?;
    if let JsonValue::Object(map) = &mut value {
        map.remove("sequence");
        map.remove("signature");
    }
    let mut out = String::new();
    write_sorted(&value, &mut out)?;
    Ok(out)
}

fn write_sorted(value: &JsonValue, out: &mut String) -> Result<(), AuditError> {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_sorted(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_sorted(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
