//! Thread registry.
//!
//! Tracks which logical conversation thread is active and derives the
//! thread-scoped signaling endpoint. Pure bookkeeping; switching threads
//! against a live channel is orchestrated by the connector, which owns the
//! disconnect/reconnect sequencing.

/// Active-thread bookkeeping for one connector instance.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    active: Option<String>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the thread id used to tag subsequent outbound sends.
    pub fn set_active(&mut self, thread_id: Option<String>) {
        self.active = thread_id;
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Whether the current connection binds to thread-scoped backend
    /// resources. Thread-scoped endpoints skip the client-config frame.
    pub fn is_thread_scoped(&self) -> bool {
        self.active.is_some()
    }

    /// Resolve the thread tag for an outbound frame: an explicit override
    /// wins, otherwise the active thread applies.
    pub fn tag(&self, explicit: Option<String>) -> Option<String> {
        explicit.or_else(|| self.active.clone())
    }

    /// Signaling URL for the current thread binding. A query appended to a
    /// path-less URL ("ws://host?x") is an invalid request target, so the
    /// authority gains a root path first.
    pub fn endpoint_url(&self, base: &str) -> String {
        let Some(thread_id) = &self.active else {
            return base.to_string();
        };
        let after_scheme = base.find("://").map_or(0, |i| i + 3);
        let (head, query) = match base[after_scheme..].find('?') {
            Some(i) => {
                let at = after_scheme + i;
                (&base[..at], Some(&base[at + 1..]))
            }
            None => (base, None),
        };
        let path = if base[after_scheme..head.len()].contains('/') {
            ""
        } else {
            "/"
        };
        match query {
            Some(query) => format!("{head}{path}?{query}&thread_id={thread_id}"),
            None => format!("{head}{path}?thread_id={thread_id}"),
        }
    }
}
