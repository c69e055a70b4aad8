//! The owning table of all live sessions.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::handle::{SessionHandle, SessionSnapshot};
use super::ids::SessionId;
use super::turn::QueryStream;
use super::{SessionError, SessionResult};
use crate::config::{ConfigError, SessionConfig};
use crate::engine::{ConnectRetry, ConnectionFactory, EngineConfig, ProcessConnectionFactory};

/// Single source of truth mapping session id → session.
///
/// One instance is constructed at startup and injected into the transport
/// layer; there is no process-wide table. The map is sharded (DashMap), so
/// unrelated sessions never contend, and every per-session operation is
/// guarded by that session's own primitives only.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    factory: Arc<dyn ConnectionFactory>,
    retry: ConnectRetry,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            retry: ConnectRetry::default(),
        }
    }

    /// Registry backed by real engine subprocesses.
    pub fn with_engine(engine: EngineConfig) -> Self {
        Self::new(ProcessConnectionFactory::new(engine))
    }

    pub fn with_retry(mut self, retry: ConnectRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Create a session, or return the existing one.
    ///
    /// Creation is idempotent: re-creating an existing id returns that
    /// session unchanged (the supplied config is ignored), so retried
    /// creations are harmless. Absent id ⇒ a generated UUID. New sessions
    /// start Disconnected with zeroed counters.
    pub fn create(
        &self,
        id: Option<SessionId>,
        config: Option<SessionConfig>,
    ) -> SessionResult<SessionHandle> {
        let config = config.unwrap_or_default();
        config.validate().map_err(SessionError::Config)?;
        let id = id.unwrap_or_else(SessionId::generate);

        let entry = self.sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session_id = %id, "session created");
            SessionHandle::new(id.clone(), config, Arc::clone(&self.factory), self.retry)
        });
        Ok(entry.value().clone())
    }

    pub fn get(&self, id: &SessionId) -> SessionResult<SessionHandle> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Destroy a session. Idempotent: an unknown id is not an error.
    ///
    /// Order matters: cancel the in-flight query and release the connection
    /// first, remove the registry entry last, so a concurrent lookup can
    /// never observe an entry whose connection has leaked.
    pub async fn destroy(&self, id: &SessionId) {
        let handle = match self.get(id) {
            Ok(handle) => handle,
            Err(_) => return,
        };
        handle.shutdown().await;
        self.sessions.remove(id);
        debug!(session_id = %id, "session destroyed");
    }

    /// Point-in-time snapshots of every live session.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Replace a session's config. Returns `false` for an unknown id;
    /// validation failures are rejected before any state is touched.
    pub fn update_config(
        &self,
        id: &SessionId,
        config: SessionConfig,
    ) -> Result<bool, ConfigError> {
        config.validate()?;
        match self.sessions.get(id) {
            Some(entry) => {
                entry.value().update_config(config)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Per-session operations addressed by id, for transport layers that do
    // not hold handles.

    pub fn send(&self, id: &SessionId, prompt: impl Into<String>) -> SessionResult<QueryStream> {
        self.get(id)?.send(prompt)
    }

    pub async fn interrupt(&self, id: &SessionId) -> SessionResult<bool> {
        Ok(self.get(id)?.interrupt().await)
    }

    pub fn clear(&self, id: &SessionId) -> SessionResult<()> {
        self.get(id)?.clear();
        Ok(())
    }

    pub fn snapshot(&self, id: &SessionId) -> SessionResult<SessionSnapshot> {
        Ok(self.get(id)?.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionState;
    use crate::session::test_support::StubFactory;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(StubFactory::idle())
    }

    #[tokio::test]
    async fn test_create_with_generated_id() {
        let registry = registry();
        let session = registry.create(None, None).unwrap();
        assert!(!session.id().as_str().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let registry = registry();
        let id = SessionId::new("dup");
        let first = registry.create(Some(id.clone()), None).unwrap();
        first.clear();

        let again = registry
            .create(
                Some(id.clone()),
                Some(SessionConfig {
                    system_prompt: Some("ignored".into()),
                    ..Default::default()
                }),
            )
            .unwrap();

        // Same session, original config untouched.
        assert_eq!(registry.len(), 1);
        assert!(again.snapshot().config.system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let registry = registry();
        let config = SessionConfig {
            max_turns: Some(0),
            ..Default::default()
        };
        let err = registry.create(None, Some(config)).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let registry = registry();
        let err = registry.get(&SessionId::new("ghost")).unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let registry = registry();
        let id = SessionId::new("gone");
        registry.create(Some(id.clone()), None).unwrap();

        registry.destroy(&id).await;
        assert!(!registry.contains(&id));
        // Destroying again is a no-op, not an error.
        registry.destroy(&id).await;
    }

    #[tokio::test]
    async fn test_new_session_starts_disconnected_and_zeroed() {
        let registry = registry();
        let session = registry.create(Some(SessionId::new("fresh")), None).unwrap();
        let snap = session.snapshot();
        assert_eq!(snap.connection_state, ConnectionState::Disconnected);
        assert_eq!(snap.message_count, 0);
        assert_eq!(snap.usage.input_tokens, 0);
        assert_eq!(snap.usage.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_update_config_unknown_id_is_false() {
        let registry = registry();
        let updated = registry
            .update_config(&SessionId::new("ghost"), SessionConfig::default())
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_list_snapshots_every_session() {
        let registry = registry();
        registry.create(Some(SessionId::new("a")), None).unwrap();
        registry.create(Some(SessionId::new("b")), None).unwrap();

        let mut ids: Vec<_> = registry
            .list()
            .into_iter()
            .map(|s| s.session_id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
