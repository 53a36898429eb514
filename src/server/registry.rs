//! Live-session registry.
//!
//! Sessions are indexed twice: by the process-local connection id and by the
//! shared id the control plane knows. A record is in both indices or in
//! neither. Watchdogs and revalidation hold ids, not records; they look
//! records back up here, so nothing keeps a dead session alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::policy::{ConnInfo, SshAction};
use crate::session::context::SessionContext;

/// One accepted session, as the registry and revalidation see it. The child
/// process handle lives in the runtime task; termination flows through
/// `ctx`.
#[derive(Debug)]
pub struct SessionRecord {
    /// Process-local connection id. Never shared outside the process.
    pub conn_id: String,
    /// `YYYYMMDDTHHMMSS-<10 hex>` id shared with the control plane.
    pub shared_id: String,
    pub conn_info: ConnInfo,
    /// The resolved terminal action (always an accept).
    pub action: SshAction,
    pub local_user: String,
    pub ctx: Arc<SessionContext>,
}

#[derive(Default)]
struct Indices {
    by_conn: HashMap<String, Arc<SessionRecord>>,
    by_shared: HashMap<String, Arc<SessionRecord>>,
}

/// Thread-safe index of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Indices>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record` into both indices atomically.
    ///
    /// Panics on an empty or duplicate id: both are programmer errors, not
    /// runtime conditions.
    pub fn register(&self, record: Arc<SessionRecord>) {
        assert!(!record.conn_id.is_empty(), "empty conn id");
        assert!(!record.shared_id.is_empty(), "empty shared id");
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.by_conn.contains_key(&record.conn_id), "duplicate conn id");
        assert!(!inner.by_shared.contains_key(&record.shared_id), "duplicate shared id");
        inner.by_conn.insert(record.conn_id.clone(), Arc::clone(&record));
        inner.by_shared.insert(record.shared_id.clone(), record);
    }

    /// Remove `record` from both indices. Removing an absent record is a
    /// no-op.
    pub fn deregister(&self, record: &SessionRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_conn.remove(&record.conn_id);
        inner.by_shared.remove(&record.shared_id);
    }

    /// Session attached to a connection, if any.
    pub fn get_by_conn(&self, conn_id: &str) -> Option<Arc<SessionRecord>> {
        self.inner.lock().unwrap().by_conn.get(conn_id).cloned()
    }

    /// Session by its control-plane-visible id, if any.
    pub fn get_by_shared(&self, shared_id: &str) -> Option<Arc<SessionRecord>> {
        self.inner.lock().unwrap().by_shared.get(shared_id).cloned()
    }

    /// All live sessions at this instant.
    pub fn snapshot(&self) -> Vec<Arc<SessionRecord>> {
        self.inner.lock().unwrap().by_conn.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::mesh::{MeshNode, UserProfile};

    fn record(conn_id: &str, shared_id: &str) -> Arc<SessionRecord> {
        Arc::new(SessionRecord {
            conn_id: conn_id.into(),
            shared_id: shared_id.into(),
            conn_info: ConnInfo {
                now: Utc::now(),
                ssh_user: "alice".into(),
                src: "100.64.0.2:3822".parse().unwrap(),
                dst: "100.64.0.1:22".parse().unwrap(),
                node: MeshNode { id: 1, stable_id: "n1".into(), name: "peer".into() },
                user_profile: UserProfile::default(),
                pub_key: None,
            },
            action: SshAction { accept: true, ..Default::default() },
            local_user: "alice".into(),
            ctx: Arc::new(SessionContext::new()),
        })
    }

    #[test]
    fn registered_in_both_indices_or_neither() {
        let reg = SessionRegistry::new();
        let rec = record("c1", "s1");
        reg.register(Arc::clone(&rec));
        assert!(reg.get_by_conn("c1").is_some());
        assert!(reg.get_by_shared("s1").is_some());
        assert_eq!(reg.len(), 1);

        reg.deregister(&rec);
        assert!(reg.get_by_conn("c1").is_none());
        assert!(reg.get_by_shared("s1").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn deregister_twice_is_a_noop() {
        let reg = SessionRegistry::new();
        let rec = record("c1", "s1");
        reg.register(Arc::clone(&rec));
        reg.deregister(&rec);
        reg.deregister(&rec);
        assert!(reg.is_empty());
    }

    #[test]
    #[should_panic(expected = "duplicate conn id")]
    fn double_register_panics() {
        let reg = SessionRegistry::new();
        reg.register(record("c1", "s1"));
        reg.register(record("c1", "s2"));
    }

    #[test]
    #[should_panic(expected = "duplicate shared id")]
    fn duplicate_shared_id_panics() {
        let reg = SessionRegistry::new();
        reg.register(record("c1", "s1"));
        reg.register(record("c2", "s1"));
    }

    #[test]
    #[should_panic(expected = "empty conn id")]
    fn empty_id_panics() {
        let reg = SessionRegistry::new();
        reg.register(record("", "s1"));
    }

    #[test]
    fn snapshot_lists_all_live_sessions() {
        let reg = SessionRegistry::new();
        reg.register(record("c1", "s1"));
        reg.register(record("c2", "s2"));
        let mut ids: Vec<String> = reg.snapshot().iter().map(|r| r.conn_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }
}
