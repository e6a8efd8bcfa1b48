//! State Snapshots
//!
//! Periodic JSON persistence of the registry: the session logs plus the
//! user-to-sessions index. Connections, outboxes, rooms and typing flags
//! are runtime-only and are deliberately not captured; after a restore the
//! sessions exist with their history but nobody is present until clients
//! reconnect and join again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::protocol::ChatMessage;
use crate::session::{Session, SessionRegistry};

/// Snapshot-related errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything about one session that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

/// The on-disk document. BTreeMaps keep the serialized form stable, so
/// consecutive snapshots of unchanged state are byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDoc {
    pub sessions: BTreeMap<String, SessionRecord>,
    /// Display name -> session tokens the name was last seen in.
    pub user_sessions: BTreeMap<String, Vec<String>>,
}

impl SnapshotDoc {
    /// Capture the durable part of the registry.
    pub fn capture(registry: &SessionRegistry) -> Self {
        let mut doc = SnapshotDoc::default();
        for session in registry.sessions() {
            doc.sessions.insert(
                session.token.clone(),
                SessionRecord {
                    token: session.token.clone(),
                    created_at: session.created_at,
                    messages: session.messages_snapshot(),
                },
            );
            for username in session.usernames() {
                let tokens = doc.user_sessions.entry(username).or_default();
                if !tokens.contains(&session.token) {
                    tokens.push(session.token.clone());
                }
            }
        }
        for tokens in doc.user_sessions.values_mut() {
            tokens.sort();
        }
        doc
    }

    /// Rebuild sessions into the registry. Sessions already live in the
    /// registry are left alone.
    pub fn restore(self, registry: &SessionRegistry) {
        let count = self.sessions.len();
        for (_, record) in self.sessions {
            registry.insert_restored(Session::restored(
                record.token,
                record.created_at,
                record.messages,
            ));
        }
        if count > 0 {
            log::info!("Restored {} session(s) from snapshot", count);
        }
    }
}

/// Reads and writes the snapshot file.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or an empty document when none exists yet.
    pub fn load(&self) -> Result<SnapshotDoc, SnapshotError> {
        if !self.path.exists() {
            return Ok(SnapshotDoc::default());
        }
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write via a temp file and rename, so a crash mid-write never leaves
    /// a truncated snapshot behind.
    pub fn store(&self, doc: &SnapshotDoc) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!(
            "snapshot written to {} ({} sessions)",
            self.path.display(),
            doc.sessions.len()
        );
        Ok(())
    }
}
