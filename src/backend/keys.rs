//! Key and channel naming.
//!
//! Every key family carries the configured namespace so sentinel data
//! never collides with unrelated keys in a shared store.

/// Namespaced key builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    /// Create a keyspace rooted at `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// State key for a task.
    #[must_use]
    pub fn task_state(&self, task_id: &str) -> String {
        format!("{}:state:{task_id}", self.namespace)
    }

    /// Interrupt channel for a task.
    #[must_use]
    pub fn task_channel(&self, task_id: &str) -> String {
        format!("{}:chan:{task_id}", self.namespace)
    }

    /// Heartbeat lease key for a session.
    #[must_use]
    pub fn heartbeat(&self, session_id: &str) -> String {
        format!("{}:heartbeat:{session_id}", self.namespace)
    }

    /// Reap lock key for a session.
    #[must_use]
    pub fn heartbeat_lock(&self, session_id: &str) -> String {
        format!("{}:heartbeat_lock:{session_id}", self.namespace)
    }

    /// Recycled marker key for a session.
    #[must_use]
    pub fn recycled(&self, session_id: &str) -> String {
        format!("{}:recycled:{session_id}", self.namespace)
    }

    /// Index of sessions holding a lease.
    #[must_use]
    pub fn session_index(&self) -> String {
        format!("{}:sessions", self.namespace)
    }

    /// Set of resource identities owned by a session.
    #[must_use]
    pub fn session_resources(&self, session_id: &str) -> String {
        format!("{}:resources:{session_id}", self.namespace)
    }

    /// Owner (single-member set) of a resource identity.
    #[must_use]
    pub fn resource_owner(&self, identity: &str) -> String {
        format!("{}:owner:{identity}", self.namespace)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("sentinel")
    }
}
