//! Command-session index: `(peer, command) → session id`.

use std::collections::HashMap;

/// Key under which a peer/command pair is indexed and bootstrapped.
pub fn session_key(peer: &str, command: u32) -> String {
    format!("{{{peer},<{command}>}}")
}

/// Maps destination and command to a cached session id.
///
/// Rows may outlive the session they point at; readers prune them when the
/// store no longer has the id.
#[derive(Debug, Default)]
pub struct CommandSessionIndex {
    rows: HashMap<String, String>,
}

impl CommandSessionIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `(peer, command)` at `session_id`, replacing any previous row
    pub fn insert(&mut self, peer: &str, command: u32, session_id: impl Into<String>) {
        self.rows.insert(session_key(peer, command), session_id.into());
    }

    /// Index every command in `commands`. Entries that do not parse as a
    /// command number are skipped.
    pub fn insert_commands(&mut self, peer: &str, commands: &[String], session_id: &str) {
        for command in commands {
            match command.trim().parse::<u32>() {
                Ok(cmd) => self.insert(peer, cmd, session_id),
                Err(_) => tracing::debug!(command = %command, "skipping non-numeric valid command"),
            }
        }
    }

    /// Session id for `(peer, command)`
    pub fn get(&self, peer: &str, command: u32) -> Option<&str> {
        self.rows.get(&session_key(peer, command)).map(String::as_str)
    }

    /// Drop one row
    pub fn remove(&mut self, peer: &str, command: u32) -> Option<String> {
        self.rows.remove(&session_key(peer, command))
    }

    /// Drop the rows `commands` created for `peer`, but only those still
    /// pointing at `session_id`
    pub fn remove_commands(&mut self, peer: &str, commands: &[String], session_id: &str) {
        for command in commands {
            if let Ok(cmd) = command.trim().parse::<u32>() {
                let key = session_key(peer, cmd);
                if self.rows.get(&key).is_some_and(|sid| sid == session_id) {
                    self.rows.remove(&key);
                }
            }
        }
    }

    /// Drop every row pointing at `session_id`
    pub fn remove_session(&mut self, session_id: &str) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, sid| sid != session_id);
        before - self.rows.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
