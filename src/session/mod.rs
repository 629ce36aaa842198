use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{LocalStore, StoreError, SESSION_KEY};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Startup state until the provider reports who is signed in.
    Resolving,
    Unauthenticated,
    Authenticated(UserId),
}

impl SessionState {
    pub fn user(&self) -> Option<&UserId> {
        match self {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_resolving(&self) -> bool {
        matches!(self, SessionState::Resolving)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("sign-in was cancelled")]
    Cancelled,
    #[error("credential provider unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Source of session identity. `subscribe` yields the current state first and
/// then every later change.
pub trait CredentialProvider: Send + Sync {
    fn subscribe(&self) -> Receiver<SessionState>;
    fn sign_in(&self) -> AuthResult<UserId>;
    fn sign_out(&self) -> AuthResult<()>;
}

#[derive(Debug)]
struct SessionBroadcast {
    current: Mutex<SessionState>,
    subscribers: Mutex<Vec<Sender<SessionState>>>,
}

impl SessionBroadcast {
    fn new(initial: SessionState) -> Self {
        Self {
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> Receiver<SessionState> {
        let (tx, rx) = unbounded();
        let current = self.current.lock().clone();
        let _ = tx.send(current);
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, state: SessionState) {
        *self.current.lock() = state.clone();
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(state.clone()).is_ok());
    }

    fn current(&self) -> SessionState {
        self.current.lock().clone()
    }
}

/// In-memory provider whose sign-in outcome is scripted up front.
#[derive(Debug)]
pub struct StaticCredentialProvider {
    broadcast: SessionBroadcast,
    sign_in_as: Mutex<Option<UserId>>,
}

impl StaticCredentialProvider {
    pub fn new(initial: SessionState) -> Self {
        Self {
            broadcast: SessionBroadcast::new(initial),
            sign_in_as: Mutex::new(None),
        }
    }

    pub fn resolving() -> Self {
        Self::new(SessionState::Resolving)
    }

    /// The user the next `sign_in` succeeds as; `None` makes it cancel.
    pub fn set_sign_in_user(&self, user: Option<UserId>) {
        *self.sign_in_as.lock() = user;
    }

    /// Pushes a state to every subscriber, as the backing auth SDK would.
    pub fn resolve(&self, state: SessionState) {
        self.broadcast.publish(state);
    }

    pub fn current(&self) -> SessionState {
        self.broadcast.current()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn subscribe(&self) -> Receiver<SessionState> {
        self.broadcast.subscribe()
    }

    fn sign_in(&self) -> AuthResult<UserId> {
        let user = self.sign_in_as.lock().clone().ok_or(AuthError::Cancelled)?;
        self.broadcast.publish(SessionState::Authenticated(user.clone()));
        Ok(user)
    }

    fn sign_out(&self) -> AuthResult<()> {
        self.broadcast.publish(SessionState::Unauthenticated);
        Ok(())
    }
}

/// Remembers the signed-in user in the local store so the session survives
/// restarts of the command-line front end.
pub struct FileCredentialProvider {
    store: Arc<dyn LocalStore>,
    broadcast: SessionBroadcast,
    sign_in_as: Mutex<Option<UserId>>,
}

impl FileCredentialProvider {
    pub fn new(store: Arc<dyn LocalStore>) -> AuthResult<Self> {
        let initial = match store.get(SESSION_KEY)? {
            Some(raw) if !raw.trim().is_empty() => {
                SessionState::Authenticated(UserId::new(raw.trim()))
            }
            _ => SessionState::Unauthenticated,
        };
        Ok(Self {
            store,
            broadcast: SessionBroadcast::new(initial),
            sign_in_as: Mutex::new(None),
        })
    }

    pub fn set_sign_in_user(&self, user: UserId) {
        *self.sign_in_as.lock() = Some(user);
    }

    pub fn current(&self) -> SessionState {
        self.broadcast.current()
    }
}

impl CredentialProvider for FileCredentialProvider {
    fn subscribe(&self) -> Receiver<SessionState> {
        self.broadcast.subscribe()
    }

    fn sign_in(&self) -> AuthResult<UserId> {
        let user = self.sign_in_as.lock().clone().ok_or(AuthError::Cancelled)?;
        self.store.set(SESSION_KEY, user.as_str())?;
        tracing::info!(user = %user, "signed in");
        self.broadcast.publish(SessionState::Authenticated(user.clone()));
        Ok(user)
    }

    fn sign_out(&self) -> AuthResult<()> {
        self.store.set(SESSION_KEY, "")?;
        tracing::info!("signed out");
        self.broadcast.publish(SessionState::Unauthenticated);
        Ok(())
    }
}
