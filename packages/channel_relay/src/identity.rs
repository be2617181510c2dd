//! Optional per-connection identity tokens.

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct IdentityAssigner {
    enabled: bool,
}

impl IdentityAssigner {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Issue a time-ordered token (UUID v7), or `None` when disabled.
    pub fn issue(&self) -> Option<String> {
        self.enabled.then(|| Uuid::now_v7().to_string())
    }
}
