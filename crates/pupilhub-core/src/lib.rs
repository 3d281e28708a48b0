//! Domain model and boundaries for PupilHub.
//!
//! This crate holds no I/O. Concrete transports and stores live in
//! `pupilhub-infrastructure`; the login flow, identity switching and the
//! schedule cache live in `pupilhub-application`.

pub mod config;
pub mod error;
pub mod identity;
pub mod schedule;
pub mod school;
pub mod session;
pub mod store;
pub mod transport;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use identity::{Identity, IdentityRegistry};
pub use schedule::{Completeness, ScheduleRecord, ScheduleStatus, evaluate};
pub use school::{SchoolHints, SchoolOption, SchoolSelection, choose};
pub use session::{Session, SessionState};
pub use store::{KeyValueStore, StoredBlob};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, RequestBody};
