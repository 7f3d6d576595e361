//! Server-side session registry and binding tokens.
//!
//! Owned by the gateway task; nothing here is shared or locked.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Binding {
    tag: String,
    issued_at: Instant,
}

/// Live sessions by id, plus outstanding binding tokens
#[derive(Debug)]
pub struct SessionRegistry<T> {
    last_session_id: u32,
    sessions: HashMap<u32, T>,
    bindings: HashMap<String, Binding>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            last_session_id: 0,
            sessions: HashMap::new(),
            bindings: HashMap::new(),
        }
    }
}

impl<T> SessionRegistry<T> {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free session id; never 0 and never one still registered
    pub fn issue_session_id(&mut self) -> u32 {
        loop {
            self.last_session_id = self.last_session_id.wrapping_add(1);
            let id = self.last_session_id;
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Track a session under `session_id`, replacing any previous entry
    pub fn register(&mut self, session_id: u32, session: T) -> Option<T> {
        self.sessions.insert(session_id, session)
    }

    /// Stop tracking a session
    pub fn unregister(&mut self, session_id: u32) -> Option<T> {
        self.sessions.remove(&session_id)
    }

    /// Look up a session
    pub fn get(&self, session_id: u32) -> Option<&T> {
        self.sessions.get(&session_id)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Issue a single-use token that binds the next session created with it to `tag`
    pub fn open_binding(&mut self, tag: impl Into<String>, now: Instant) -> String {
        let token = Uuid::new_v4().to_string();
        let tag = tag.into();
        debug!(%token, %tag, "Binding opened");
        self.bindings.insert(
            token.clone(),
            Binding {
                tag,
                issued_at: now,
            },
        );
        token
    }

    /// Consume a token, returning the tag it was opened for
    pub fn take_binding(&mut self, token: &str) -> Option<String> {
        self.bindings.remove(token).map(|b| b.tag)
    }

    /// Number of outstanding tokens
    pub fn pending_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Drop tokens older than `timeout`, returning their tags
    pub fn sweep_bindings(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        self.bindings.retain(|_, binding| {
            if now.saturating_duration_since(binding.issued_at) >= timeout {
                expired.push(binding.tag.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}
