//! Typed view of the persisted account mapping.
//!
//! Layout of the stored blob:
//!
//! | key | value |
//! |---|---|
//! | `pupil_data` | identity id → schedule record |
//! | `pupil_ids` | known identity ids, in discovery order |
//! | `pupil_names` | identity id → display name |
//! | `selected_school_url` / `selected_school_name` | last school selection |
//! | `last_successful_update` / `last_auth_success` | RFC 3339 timestamps |

use crate::cache::DebouncedCache;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use pupilhub_core::schedule::ScheduleView;
use pupilhub_core::{Identity, ScheduleRecord, ScheduleStatus, SchoolOption, StoredBlob};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

const PUPIL_DATA: &str = "pupil_data";
const PUPIL_IDS: &str = "pupil_ids";
const PUPIL_NAMES: &str = "pupil_names";
const SELECTED_SCHOOL_URL: &str = "selected_school_url";
const SELECTED_SCHOOL_NAME: &str = "selected_school_name";
const LAST_SUCCESSFUL_UPDATE: &str = "last_successful_update";
const LAST_AUTH_SUCCESS: &str = "last_auth_success";

fn empty_layout() -> StoredBlob {
    let mut blob = Map::new();
    blob.insert(LAST_SUCCESSFUL_UPDATE.to_string(), JsonValue::Null);
    blob.insert(LAST_AUTH_SUCCESS.to_string(), JsonValue::Null);
    blob.insert(PUPIL_DATA.to_string(), json!({}));
    blob.insert(PUPIL_IDS.to_string(), json!([]));
    blob.insert(PUPIL_NAMES.to_string(), json!({}));
    blob
}

/// Schedule records and account metadata on top of a [`DebouncedCache`].
///
/// Data older than the retention window is discarded the first time the
/// cache is read.
pub struct ScheduleCache {
    cache: DebouncedCache,
    retention: Duration,
    retention_checked: AtomicBool,
}

impl ScheduleCache {
    pub fn new(cache: DebouncedCache, retention_days: i64) -> Self {
        Self {
            cache,
            retention: Duration::days(retention_days),
            retention_checked: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &DebouncedCache {
        &self.cache
    }

    async fn snapshot(&self) -> StoredBlob {
        self.apply_retention().await;
        self.cache.load().await
    }

    async fn mutate<F>(&self, mutator: F)
    where
        F: FnOnce(&mut StoredBlob),
    {
        self.apply_retention().await;
        self.cache.update(mutator).await;
    }

    async fn apply_retention(&self) {
        if self.retention_checked.swap(true, Ordering::AcqRel) {
            return;
        }
        let blob = self.cache.load().await;
        if let Some(updated) = timestamp(&blob, LAST_SUCCESSFUL_UPDATE) {
            let age = Utc::now() - updated;
            if age > self.retention {
                tracing::info!(
                    target: "pupilhub::cache",
                    age_days = age.num_days(),
                    "Discarding cached data past the retention window"
                );
                self.cache.save(empty_layout()).await;
            }
        }
    }

    /// Stores a successful fetch and stamps the update time.
    pub async fn record_fresh(&self, record: ScheduleRecord) {
        let id = record.identity_id.clone();
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    target: "pupilhub::cache",
                    identity = %id,
                    error = %e,
                    "Could not encode schedule record"
                );
                return;
            }
        };
        self.mutate(move |blob| {
            if let Some(data) = object_entry(blob, PUPIL_DATA) {
                data.insert(id, value);
            }
            blob.insert(LAST_SUCCESSFUL_UPDATE.to_string(), json!(Utc::now().to_rfc3339()));
        })
        .await;
    }

    /// Marks a failed refresh. A record that was fresh or cached is kept as
    /// `Cached`; an identity that never produced a record stays `Missing`.
    pub async fn mark_refresh_failed(&self, identity_id: &str) -> ScheduleStatus {
        let mut outcome = ScheduleStatus::Missing;
        self.mutate(|blob| {
            let Some(data) = object_entry(blob, PUPIL_DATA) else {
                return;
            };
            match data.get_mut(identity_id) {
                Some(JsonValue::Object(record)) if holds_data(record) => {
                    record.insert(
                        "schedule_status".to_string(),
                        json!(ScheduleStatus::Cached.as_str()),
                    );
                    outcome = ScheduleStatus::Cached;
                }
                Some(JsonValue::Object(record)) if !record.is_empty() => {}
                _ => {
                    let placeholder = ScheduleRecord::missing(identity_id);
                    if let Ok(value) = serde_json::to_value(&placeholder) {
                        data.insert(identity_id.to_string(), value);
                    }
                }
            }
        })
        .await;
        outcome
    }

    /// Raw stored records, as consumed by the completeness guard.
    pub async fn stored_records(&self) -> HashMap<String, JsonValue> {
        match self.snapshot().await.remove(PUPIL_DATA) {
            Some(JsonValue::Object(data)) => data.into_iter().collect(),
            _ => HashMap::new(),
        }
    }

    pub async fn record(&self, identity_id: &str) -> Option<ScheduleRecord> {
        let value = self.stored_records().await.remove(identity_id)?;
        match serde_json::from_value::<ScheduleRecord>(value) {
            Ok(mut record) => {
                if record.identity_id.is_empty() {
                    record.identity_id = identity_id.to_string();
                }
                Some(record)
            }
            Err(e) => {
                tracing::debug!(
                    target: "pupilhub::cache",
                    identity = identity_id,
                    error = %e,
                    "Stored record is unreadable"
                );
                None
            }
        }
    }

    /// Remembers the discovered identities and their names.
    pub async fn set_identities(&self, identities: &[Identity]) {
        let ids: Vec<JsonValue> = identities
            .iter()
            .map(|i| JsonValue::String(i.id.clone()))
            .collect();
        let names: Map<String, JsonValue> = identities
            .iter()
            .filter_map(|i| {
                let name = i.display_name.clone()?;
                Some((i.id.clone(), JsonValue::String(name)))
            })
            .collect();
        self.mutate(move |blob| {
            blob.insert(PUPIL_IDS.to_string(), JsonValue::Array(ids));
            blob.insert(PUPIL_NAMES.to_string(), JsonValue::Object(names));
        })
        .await;
    }

    /// Identities known from a previous run, without switch tokens.
    pub async fn identities(&self) -> Vec<Identity> {
        let blob = self.snapshot().await;
        let names = blob.get(PUPIL_NAMES).and_then(JsonValue::as_object);
        blob.get(PUPIL_IDS)
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(JsonValue::as_str)
            .map(|id| {
                let name = names.and_then(|n| n.get(id)).and_then(JsonValue::as_str);
                match name {
                    Some(name) => Identity::new(id).with_name(name),
                    None => Identity::new(id),
                }
            })
            .collect()
    }

    pub async fn selected_school(&self) -> Option<SchoolOption> {
        let blob = self.snapshot().await;
        let url = blob.get(SELECTED_SCHOOL_URL)?.as_str()?;
        let label = blob.get(SELECTED_SCHOOL_NAME).and_then(JsonValue::as_str).unwrap_or_default();
        Some(SchoolOption::new(label, url))
    }

    pub async fn set_selected_school(&self, school: &SchoolOption) {
        let url = school.login_url.clone();
        let label = school.label.clone();
        tracing::info!(target: "pupilhub::cache", school = %label, "Remembering school selection");
        self.mutate(move |blob| {
            blob.insert(SELECTED_SCHOOL_URL.to_string(), json!(url));
            blob.insert(SELECTED_SCHOOL_NAME.to_string(), json!(label));
        })
        .await;
    }

    pub async fn record_auth_success(&self) {
        self.mutate(|blob| {
            blob.insert(LAST_AUTH_SUCCESS.to_string(), json!(Utc::now().to_rfc3339()));
        })
        .await;
    }

    pub async fn last_successful_update(&self) -> Option<DateTime<Utc>> {
        timestamp(&self.snapshot().await, LAST_SUCCESSFUL_UPDATE)
    }

    pub async fn last_auth_success(&self) -> Option<DateTime<Utc>> {
        timestamp(&self.snapshot().await, LAST_AUTH_SUCCESS)
    }

    /// Whether the last successful update is younger than `max_age`.
    pub async fn has_recent_data(&self, max_age: Duration) -> bool {
        self.last_successful_update()
            .await
            .is_some_and(|updated| Utc::now() - updated < max_age)
    }

    /// Drops everything, school selection included.
    pub async fn clear(&self) {
        self.cache.save(empty_layout()).await;
    }

    pub async fn flush(&self) {
        self.cache.flush().await;
    }
}

/// The object under `key`, replacing a missing or malformed value.
fn object_entry<'a>(blob: &'a mut StoredBlob, key: &str) -> Option<&'a mut Map<String, JsonValue>> {
    let slot = blob.entry(key.to_string()).or_insert_with(|| json!({}));
    if !slot.is_object() {
        *slot = json!({});
    }
    slot.as_object_mut()
}

/// Whether a stored record carries data worth keeping as stale: an explicit
/// fresh or cached status, or a legacy record with a populated schedule.
fn holds_data(record: &Map<String, JsonValue>) -> bool {
    let value = JsonValue::Object(record.clone());
    value.effective_status() != ScheduleStatus::Missing
}

/// Reads an RFC 3339 timestamp, accepting naive values as UTC.
fn timestamp(blob: &StoredBlob, key: &str) -> Option<DateTime<Utc>> {
    let raw = blob.get(key)?.as_str()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use chrono::NaiveDate;
    use pupilhub_core::config::CacheConfig;
    use pupilhub_core::evaluate;
    use pupilhub_core::schedule::{EntryKind, ScheduleEntry};
    use std::sync::Arc;

    fn schedule_cache(store: Arc<MemoryStore>) -> ScheduleCache {
        ScheduleCache::new(DebouncedCache::new(store, CacheConfig::default()), 14)
    }

    fn entry(day: u32) -> ScheduleEntry {
        ScheduleEntry {
            date: NaiveDate::from_ymd_opt(2024, 9, day).unwrap(),
            kind: EntryKind::Timetable,
            payload: json!({"title": "Math"}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_demotes_or_marks_missing() {
        let cache = schedule_cache(MemoryStore::new());
        cache.record_fresh(ScheduleRecord::fresh("a", vec![entry(3), entry(2)])).await;

        assert_eq!(cache.mark_refresh_failed("a").await, ScheduleStatus::Cached);
        assert_eq!(cache.mark_refresh_failed("b").await, ScheduleStatus::Missing);

        let record = cache.record("a").await.unwrap();
        assert_eq!(record.status, Some(ScheduleStatus::Cached));
        assert_eq!(record.entries[0].date, NaiveDate::from_ymd_opt(2024, 9, 2).unwrap());

        let report = evaluate(&["a", "b", "c"], &cache.stored_records().await);
        assert_eq!(report.stale, vec!["a"]);
        assert_eq!(report.missing, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_keep_identity_missing() {
        let cache = schedule_cache(MemoryStore::new());

        assert_eq!(cache.mark_refresh_failed("x").await, ScheduleStatus::Missing);
        assert_eq!(cache.mark_refresh_failed("x").await, ScheduleStatus::Missing);

        let report = evaluate(&["x"], &cache.stored_records().await);
        assert_eq!(report.missing, vec!["x"]);
        assert!(report.stale.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_demotes_legacy_record_with_schedule() {
        let store = MemoryStore::new();
        let mut blob = empty_layout();
        blob.insert(
            PUPIL_DATA.to_string(),
            json!({
                "a": {"schedule": [{"date": "2024-09-02", "kind": "timetable", "payload": {}}]},
                "b": {"schedule": []},
            }),
        );
        store.seed("pupilhub_data", blob);
        let cache = schedule_cache(store);

        assert_eq!(cache.mark_refresh_failed("a").await, ScheduleStatus::Cached);
        assert_eq!(cache.mark_refresh_failed("b").await, ScheduleStatus::Missing);

        let report = evaluate(&["a", "b"], &cache.stored_records().await);
        assert_eq!(report.stale, vec!["a"]);
        assert_eq!(report.missing, vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_record_counts_as_fresh() {
        let store = MemoryStore::new();
        let mut blob = empty_layout();
        blob.insert(
            PUPIL_DATA.to_string(),
            json!({
                "a": {"schedule": [{"date": "2024-09-02", "kind": "timetable", "payload": {}}]}
            }),
        );
        blob.insert(LAST_SUCCESSFUL_UPDATE.to_string(), json!(Utc::now().to_rfc3339()));
        store.seed("pupilhub_data", blob);
        let cache = schedule_cache(store);

        let report = evaluate(&["a"], &cache.stored_records().await);
        assert!(report.complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_past_retention_is_discarded() {
        let store = MemoryStore::new();
        let mut blob = empty_layout();
        blob.insert(PUPIL_IDS.to_string(), json!(["a"]));
        let old = Utc::now() - Duration::days(20);
        blob.insert(LAST_SUCCESSFUL_UPDATE.to_string(), json!(old.to_rfc3339()));
        store.seed("pupilhub_data", blob);
        let cache = schedule_cache(store.clone());

        assert!(cache.identities().await.is_empty());
        assert_eq!(cache.last_successful_update().await, None);
        cache.flush().await;
        assert_eq!(store.stored("pupilhub_data"), Some(empty_layout()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identities_and_school_round_trip() {
        let cache = schedule_cache(MemoryStore::new());
        cache
            .set_identities(&[Identity::new("1").with_name("Alva"), Identity::new("2")])
            .await;
        cache
            .set_selected_school(&SchoolOption::new("Goteborgs Stad", "https://sso.test/gbg"))
            .await;

        let identities = cache.identities().await;
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].display_name.as_deref(), Some("Alva"));
        assert_eq!(identities[1].display_name, None);

        let school = cache.selected_school().await.unwrap();
        assert_eq!(school.login_url, "https://sso.test/gbg");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_data_and_timestamps() {
        let cache = schedule_cache(MemoryStore::new());
        assert!(!cache.has_recent_data(Duration::hours(24)).await);
        assert_eq!(cache.last_auth_success().await, None);

        cache.record_fresh(ScheduleRecord::fresh("a", vec![entry(2)])).await;
        cache.record_auth_success().await;

        assert!(cache.has_recent_data(Duration::hours(24)).await);
        assert!(cache.last_auth_success().await.is_some());
    }

    #[test]
    fn test_naive_timestamps_are_read_as_utc() {
        let mut blob = StoredBlob::new();
        blob.insert("t".to_string(), json!("2024-09-02T08:30:00.123456"));
        let parsed = timestamp(&blob, "t").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-09-02T08:30:00.123456+00:00");
    }
}
