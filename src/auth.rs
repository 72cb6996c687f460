use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of the bearer token used for channel authentication and history
/// requests. Token issuance and refresh live outside this crate.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;

    /// Called when the server rejects the token handed out by `access_token`.
    fn on_token_expired(&self) {}
}

/// Token held in memory, replaced by the login flow.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
    expired_notifications: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|value| !value.trim().is_empty())),
            expired_notifications: AtomicUsize::new(0),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token.filter(|value| !value.trim().is_empty());
    }

    pub fn expired_notifications(&self) -> usize {
        self.expired_notifications.load(Ordering::Relaxed)
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn on_token_expired(&self) {
        self.expired_notifications.fetch_add(1, Ordering::Relaxed);
    }
}
