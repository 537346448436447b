//! WebSocket and SFTP session registries.
//!
//! The daemon does not own session transports, only their lifetimes: each
//! registered session deposits a cancel handle keyed by the owning user so
//! a Panel deauthorization can sever every connection that user holds.

use std::sync::{Arc, Mutex};

use roost_error::CommonError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct SessionEntry {
    id: Uuid,
    user: Uuid,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    sessions: Vec<SessionEntry>,
}

/// Registry of live sessions for one server and one transport.
pub struct SessionRegistry {
    /// Maximum live sessions across all users; zero means unlimited.
    limit: usize,
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Registers a session for `user`, returning a guard that deregisters
    /// on drop. Fails with a conflict error when the per-server cap is
    /// reached.
    pub fn register(&self, user: Uuid) -> Result<SessionGuard, CommonError> {
        let mut inner = self.inner.lock().expect("session registry poisoned");
        if self.limit > 0 && inner.sessions.len() >= self.limit {
            return Err(CommonError::conflict(format!(
                "session limit of {} reached for this server",
                self.limit
            )));
        }
        let entry = SessionEntry {
            id: Uuid::new_v4(),
            user,
            cancel: CancellationToken::new(),
        };
        let guard = SessionGuard {
            id: entry.id,
            cancel: entry.cancel.clone(),
            registry: Arc::clone(&self.inner),
        };
        inner.sessions.push(entry);
        Ok(guard)
    }

    /// Cancels every session belonging to `user`.
    pub fn deauthorize(&self, user: Uuid) {
        let inner = self.inner.lock().expect("session registry poisoned");
        for session in inner.sessions.iter().filter(|s| s.user == user) {
            session.cancel.cancel();
        }
    }

    /// Cancels everything; used at deletion.
    pub fn cancel_all(&self) {
        let inner = self.inner.lock().expect("session registry poisoned");
        for session in &inner.sessions {
            session.cancel.cancel();
        }
    }

    /// Live session count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("session registry poisoned").sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-user session count, used to group SFTP activity.
    #[must_use]
    pub fn count_for(&self, user: Uuid) -> usize {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .sessions
            .iter()
            .filter(|s| s.user == user)
            .count()
    }
}

/// Live-session handle: dropped on disconnect, cancelled on deauthorize.
pub struct SessionGuard {
    id: Uuid,
    cancel: CancellationToken,
    registry: Arc<Mutex<Inner>>,
}

impl SessionGuard {
    /// The token a session's pump selects on; cancellation means the user
    /// was deauthorized or the server is going away.
    #[must_use]
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut inner = self.registry.lock().expect("session registry poisoned");
        inner.sessions.retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_enforced_and_released_on_drop() {
        let registry = SessionRegistry::new(2);
        let user = Uuid::new_v4();
        let a = registry.register(user).unwrap();
        let _b = registry.register(user).unwrap();
        assert!(registry.register(user).is_err());

        drop(a);
        assert!(registry.register(user).is_ok());
    }

    #[test]
    fn deauthorize_cancels_only_that_user() {
        let registry = SessionRegistry::new(0);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a = registry.register(alice).unwrap();
        let b = registry.register(bob).unwrap();

        registry.deauthorize(alice);
        assert!(a.cancelled().is_cancelled());
        assert!(!b.cancelled().is_cancelled());
    }
}
