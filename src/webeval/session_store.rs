//! Persisted agent conversation history.
//!
//! When session persistence is enabled, the control agent's conversation
//! turns are appended to a local JSONL store keyed by session id. Records
//! are hash-chained: each entry carries the sha256 of its predecessor, so a
//! truncated or edited history is detectable on load. This is the only
//! durable state the evaluator keeps.
//!
//! # Example
//!
//! ```rust,no_run
//! use webeval::session_store::SessionStore;
//!
//! let store = SessionStore::open("data/sessions.jsonl")?;
//! store.append("session-1", "user", "start the assessment")?;
//! store.append("session-1", "agent", "started")?;
//!
//! for record in store.history("session-1") {
//!     println!("{}: {}", record.role, record.content);
//! }
//! assert!(store.verify_chain("session-1"));
//! # Ok::<(), std::io::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One persisted conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub prev_hash: String,
    pub hash: String,
}

impl SessionRecord {
    fn compute_hash(
        prev_hash: &str,
        session_id: &str,
        role: &str,
        content: &str,
        timestamp: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(session_id.as_bytes());
        hasher.update(role.as_bytes());
        hasher.update(content.as_bytes());
        hasher.update(timestamp.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Append-only JSONL store of conversation history, one file per evaluator.
pub struct SessionStore {
    path: PathBuf,
    records: Mutex<Vec<SessionRecord>>,
}

impl SessionStore {
    /// Open (or create) the store at the given path, loading and verifying
    /// existing records. Corrupt lines fail the open rather than being
    /// silently dropped.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: SessionRecord = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("corrupt session record at line {}: {}", number + 1, e),
                    )
                })?;
                records.push(record);
            }
        }

        let store = Self {
            path,
            records: Mutex::new(records),
        };
        for session_id in store.sessions() {
            if !store.verify_chain(&session_id) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("hash chain broken for session {}", session_id),
                ));
            }
        }
        Ok(store)
    }

    /// Append a conversation turn to a session's chain.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use webeval::session_store::SessionStore;
    /// # let store = SessionStore::open("data/sessions.jsonl")?;
    /// let record = store.append("session-1", "user", "hello")?;
    /// assert_eq!(record.session_id, "session-1");
    /// assert_eq!(record.hash.len(), 64);
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn append(&self, session_id: &str, role: &str, content: &str) -> io::Result<SessionRecord> {
        let mut records = self.records.lock().expect("session store lock poisoned");
        let prev_hash = records
            .iter()
            .rev()
            .find(|r| r.session_id == session_id)
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let timestamp = Utc::now().to_rfc3339();
        let hash = SessionRecord::compute_hash(&prev_hash, session_id, role, content, &timestamp);
        let record = SessionRecord {
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp,
            prev_hash,
            hash,
        };

        let line = serde_json::to_string(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;

        records.push(record.clone());
        Ok(record)
    }

    /// All records of one session, in append order.
    pub fn history(&self, session_id: &str) -> Vec<SessionRecord> {
        self.records
            .lock()
            .expect("session store lock poisoned")
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Distinct session ids in first-seen order.
    pub fn sessions(&self) -> Vec<String> {
        let records = self.records.lock().expect("session store lock poisoned");
        let mut seen = Vec::new();
        for record in records.iter() {
            if !seen.contains(&record.session_id) {
                seen.push(record.session_id.clone());
            }
        }
        seen
    }

    /// Verify a session's hash chain.
    pub fn verify_chain(&self, session_id: &str) -> bool {
        let mut prev = GENESIS_HASH.to_string();
        for record in self.history(session_id) {
            if record.prev_hash != prev {
                return false;
            }
            let expected = SessionRecord::compute_hash(
                &record.prev_hash,
                &record.session_id,
                &record.role,
                &record.content,
                &record.timestamp,
            );
            if record.hash != expected {
                return false;
            }
            prev = record.hash;
        }
        true
    }

    /// Drop a session's records and rewrite the store file.
    pub fn destroy(&self, session_id: &str) -> io::Result<()> {
        let mut records = self.records.lock().expect("session store lock poisoned");
        records.retain(|r| r.session_id != session_id);

        let mut file = fs::File::create(&self.path)?;
        for record in records.iter() {
            let line = serde_json::to_string(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SessionStore {
        SessionStore::open(dir.path().join("sessions.jsonl")).unwrap()
    }

    #[test]
    fn test_append_and_history() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.append("s1", "user", "start the assessment").unwrap();
        store.append("s1", "agent", "started").unwrap();
        store.append("s2", "user", "unrelated").unwrap();

        let history = store.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "start the assessment");
        assert_eq!(history[1].role, "agent");
        assert_eq!(store.sessions(), vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_chain_links() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = store.append("s1", "user", "one").unwrap();
        let second = store.append("s1", "agent", "two").unwrap();
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert!(store.verify_chain("s1"));
    }

    #[test]
    fn test_reload_preserves_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.jsonl");
        {
            let store = SessionStore::open(&path).unwrap();
            store.append("s1", "user", "persisted").unwrap();
        }
        let reloaded = SessionStore::open(&path).unwrap();
        let history = reloaded.history("s1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "persisted");
        assert!(reloaded.verify_chain("s1"));
    }

    #[test]
    fn test_tampered_chain_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.jsonl");
        {
            let store = SessionStore::open(&path).unwrap();
            store.append("s1", "user", "original").unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap().replace("original", "tampered");
        fs::write(&path, contents).unwrap();

        assert!(SessionStore::open(&path).is_err());
    }

    #[test]
    fn test_destroy_removes_only_target_session() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.append("s1", "user", "one").unwrap();
        store.append("s2", "user", "two").unwrap();

        store.destroy("s1").unwrap();
        assert!(store.history("s1").is_empty());
        assert_eq!(store.history("s2").len(), 1);

        // The rewrite survives a reload.
        let reloaded = SessionStore::open(store.path()).unwrap();
        assert!(reloaded.history("s1").is_empty());
        assert_eq!(reloaded.history("s2").len(), 1);
    }
}
