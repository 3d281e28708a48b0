use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Freshness of one identity's cached schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Just fetched.
    Fresh,
    /// Latest refresh failed; prior data retained.
    Cached,
    /// Never fetched successfully.
    Missing,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Fresh => "fresh",
            ScheduleStatus::Cached => "cached",
            ScheduleStatus::Missing => "missing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fresh" => Some(ScheduleStatus::Fresh),
            "cached" => Some(ScheduleStatus::Cached),
            "missing" => Some(ScheduleStatus::Missing),
            _ => None,
        }
    }
}

/// Source endpoint of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Timetable,
    TimeRegistration,
}

/// One dated schedule item. The payload is the raw entry as served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub date: NaiveDate,
    pub kind: EntryKind,
    #[serde(default)]
    pub payload: JsonValue,
}

/// Cached schedule for one identity.
///
/// Field names match the persisted layout, so records written before the
/// status field existed still load (with `status == None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    #[serde(default)]
    pub identity_id: String,
    #[serde(rename = "schedule", default)]
    pub entries: Vec<ScheduleEntry>,
    #[serde(rename = "schedule_status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScheduleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScheduleRecord {
    /// A record produced by a successful fetch.
    pub fn fresh(identity_id: impl Into<String>, mut entries: Vec<ScheduleEntry>) -> Self {
        entries.sort_by_key(|entry| entry.date);
        Self {
            identity_id: identity_id.into(),
            entries,
            status: Some(ScheduleStatus::Fresh),
            updated_at: Some(Utc::now()),
        }
    }

    /// A placeholder for an identity that has never been fetched.
    pub fn missing(identity_id: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            entries: Vec::new(),
            status: Some(ScheduleStatus::Missing),
            updated_at: None,
        }
    }

    /// Keeps the data but marks it as stale after a failed refresh.
    pub fn demote(&mut self) {
        self.status = Some(ScheduleStatus::Cached);
    }
}

/// Inclusive date range for schedule fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    /// One week starting today.
    pub fn upcoming_week() -> Self {
        let start = Utc::now().date_naive();
        Self::new(start, start + Duration::weeks(1))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Query/body parameters understood by the schedule endpoints.
    pub fn params(&self) -> Vec<(String, String)> {
        vec![
            ("startDate".to_string(), self.start.format("%Y-%m-%d").to_string()),
            ("endDate".to_string(), self.end.format("%Y-%m-%d").to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_record_without_status_loads() {
        let record: ScheduleRecord = serde_json::from_value(json!({
            "schedule": [{"date": "2024-09-02", "kind": "timetable", "payload": {"title": "Math"}}]
        }))
        .unwrap();

        assert_eq!(record.status, None);
        assert_eq!(record.entries.len(), 1);
    }

    #[test]
    fn test_fresh_sorts_entries_by_date() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 9, d).unwrap();
        let entry = |d| ScheduleEntry {
            date: day(d),
            kind: EntryKind::Timetable,
            payload: JsonValue::Null,
        };
        let record = ScheduleRecord::fresh("a", vec![entry(4), entry(2), entry(3)]);

        let dates: Vec<_> = record.entries.iter().map(|e| e.date).collect();
        assert_eq!(dates, vec![day(2), day(3), day(4)]);
        assert_eq!(record.status, Some(ScheduleStatus::Fresh));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let mut record = ScheduleRecord::missing("a");
        record.demote();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["schedule_status"], "cached");
    }

    #[test]
    fn test_date_range_params() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 9, 8).unwrap(),
            NaiveDate::from_ymd_opt(2024, 9, 2).unwrap(),
        );
        assert_eq!(
            range.params(),
            vec![
                ("startDate".to_string(), "2024-09-02".to_string()),
                ("endDate".to_string(), "2024-09-08".to_string()),
            ]
        );
    }
}
