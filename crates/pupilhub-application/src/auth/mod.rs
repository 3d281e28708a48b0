//! Login state machine and the page extractors it relies on.

mod authenticator;
pub mod extract;

pub use authenticator::{Credentials, IdentityDiscovery, LoginOutcome, SessionAuthenticator};
