//! Schedule records, freshness tagging and the completeness guard.

mod guard;
mod parse;
mod record;

pub use guard::{Completeness, ScheduleView, evaluate};
pub use parse::{parse_entries, parse_loose_date};
pub use record::{DateRange, EntryKind, ScheduleEntry, ScheduleRecord, ScheduleStatus};
