//! Authenticated session state.

use crate::error::{HubError, Result};
use crate::identity::IdentityRegistry;

/// Cookie-backed session state as the core sees it.
///
/// The cookies themselves live in the transport. This struct tracks what the
/// core knows about them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    pub active_identity: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops everything known about the server-side session.
    pub fn reset(&mut self) {
        self.authenticated = false;
        self.active_identity = None;
    }

    /// Records `id` as the server-side active identity.
    ///
    /// Fails with `UnknownIdentity` when `id` is not registered, so the
    /// active identity always refers to a registry entry.
    pub fn activate(&mut self, id: &str, registry: &IdentityRegistry) -> Result<()> {
        if !registry.contains(id) {
            return Err(HubError::UnknownIdentity(id.to_string()));
        }
        self.active_identity = Some(id.to_string());
        Ok(())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active_identity.as_deref() == Some(id)
    }
}

/// Session plus the identity registry it owns.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session: Session,
    pub registry: IdentityRegistry,
}
