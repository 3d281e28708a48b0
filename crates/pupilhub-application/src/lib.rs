//! Application layer for PupilHub.
//!
//! Drives the portal through the injected transport: the login state
//! machine, identity switching, request pacing, and the debounced schedule
//! cache. [`HubClient`] ties them into one scoped session handle.

pub mod auth;
mod backoff;
pub mod cache;
pub mod client;
pub mod executor;
pub mod schedule_cache;
pub mod switcher;

#[cfg(test)]
mod testing;

pub use auth::{Credentials, IdentityDiscovery, LoginOutcome, SessionAuthenticator};
pub use cache::DebouncedCache;
pub use client::HubClient;
pub use executor::{RequestExecutor, VerbFallbackPlan};
pub use schedule_cache::ScheduleCache;
pub use switcher::IdentitySwitcher;
