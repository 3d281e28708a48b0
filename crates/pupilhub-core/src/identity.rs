//! Identities (pupils) the authenticated account can act as.

use serde::{Deserialize, Serialize};

/// A dependent profile the account can view or act as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable external identifier.
    pub id: String,
    pub display_name: Option<String>,
    /// Opaque value that activates this identity server-side.
    pub switch_token: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            switch_token: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.switch_token = Some(token.into());
        self
    }

    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Identities keyed by `id`, in discovery order.
///
/// No two entries share an `id`. Later discovery passes fill in fields that
/// are still absent without clobbering known values with `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRegistry {
    entries: Vec<Identity>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.entries.iter().find(|identity| identity.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|identity| identity.id.clone()).collect()
    }

    /// Inserts a new identity or merges known fields into an existing one.
    ///
    /// Returns true when the registry changed.
    pub fn upsert(&mut self, identity: Identity) -> bool {
        match self.entries.iter_mut().find(|existing| existing.id == identity.id) {
            Some(existing) => {
                let mut changed = false;
                if identity.display_name.is_some()
                    && existing.display_name != identity.display_name
                {
                    existing.display_name = identity.display_name;
                    changed = true;
                }
                if identity.switch_token.is_some()
                    && existing.switch_token != identity.switch_token
                {
                    existing.switch_token = identity.switch_token;
                    changed = true;
                }
                changed
            }
            None => {
                self.entries.push(identity);
                true
            }
        }
    }

    /// Merges every identity from `other`, preserving first-seen order.
    pub fn merge(&mut self, other: impl IntoIterator<Item = Identity>) {
        for identity in other {
            self.upsert(identity);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<Identity> for IdentityRegistry {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        let mut registry = Self::new();
        registry.merge(iter);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_ids_unique() {
        let mut registry = IdentityRegistry::new();
        assert!(registry.upsert(Identity::new("1")));
        assert!(registry.upsert(Identity::new("2")));
        assert!(!registry.upsert(Identity::new("1")));
        assert_eq!(registry.ids(), vec!["1", "2"]);
    }

    #[test]
    fn test_upsert_fills_lazily_without_clobbering() {
        let mut registry = IdentityRegistry::new();
        registry.upsert(Identity::new("7").with_name("Felix"));
        registry.upsert(Identity::new("7").with_token("9001"));

        let identity = registry.get("7").unwrap();
        assert_eq!(identity.display_name.as_deref(), Some("Felix"));
        assert_eq!(identity.switch_token.as_deref(), Some("9001"));
        assert_eq!(identity.label(), "Felix");
    }
}
