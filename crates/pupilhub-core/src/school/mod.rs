//! Login targets offered to multi-tenant accounts.

mod selector;

pub use selector::{
    SchoolHints, SchoolSelection, choose, domain_hint_from_username, normalize_domain_hint,
};

use serde::{Deserialize, Serialize};

/// One login target offered during the school-selection step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchoolOption {
    pub label: String,
    pub login_url: String,
}

impl SchoolOption {
    pub fn new(label: impl Into<String>, login_url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            login_url: login_url.into(),
        }
    }
}
