use super::record::{EntryKind, ScheduleEntry};
use crate::error::{HubError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

const TIMETABLE_LIST_KEYS: &[&str] = &[
    "entries",
    "events",
    "items",
    "data",
    "timetableEntries",
    "lessons",
    "calendarEntries",
    "calendar",
];

const TIME_REGISTRATION_LIST_KEYS: &[&str] = &[
    "days",
    "calendar",
    "calendarData",
    "entries",
    "items",
    "data",
    "schedules",
];

const DATE_FIELDS: &[&str] = &[
    "date",
    "startDate",
    "start",
    "startDateTime",
    "scheduleDate",
    "registrationDate",
];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"];

/// Extracts dated entries from a schedule endpoint payload.
///
/// The entry list is looked up under the first known key that holds an
/// array; a bare array payload is used as is. Entries without a parseable
/// date are skipped. A payload that is neither an object nor an array is a
/// [`HubError::Parse`].
pub fn parse_entries(kind: EntryKind, payload: &JsonValue) -> Result<Vec<ScheduleEntry>> {
    let keys = match kind {
        EntryKind::Timetable => TIMETABLE_LIST_KEYS,
        EntryKind::TimeRegistration => TIME_REGISTRATION_LIST_KEYS,
    };

    let items = match payload {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => {
            match keys.iter().find_map(|key| map.get(*key).and_then(JsonValue::as_array)) {
                Some(items) => items,
                None => {
                    tracing::debug!(?kind, "No schedule list found in payload");
                    return Ok(Vec::new());
                }
            }
        }
        other => {
            return Err(HubError::parse(
                format!("{kind:?} payload"),
                format!("expected object or array, got {}", json_type(other)),
            ));
        }
    };

    let mut entries: Vec<ScheduleEntry> = items
        .iter()
        .filter_map(|item| {
            let date = DATE_FIELDS
                .iter()
                .filter_map(|field| item.get(*field).and_then(JsonValue::as_str))
                .find_map(parse_loose_date);
            if date.is_none() {
                tracing::debug!(?kind, "Skipping schedule item without a usable date");
            }
            date.map(|date| ScheduleEntry {
                date,
                kind,
                payload: item.clone(),
            })
        })
        .collect();

    entries.sort_by_key(|entry| entry.date);
    Ok(entries)
}

/// Parses the date formats seen on schedule endpoints.
pub fn parse_loose_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        })
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    #[test]
    fn test_timetable_entries_from_known_key() {
        let payload = json!({
            "lessons": [
                {"title": "Math", "startDate": "2024-09-03T08:15:00"},
                {"title": "Art", "date": "02.09.2024"},
                {"title": "No date"}
            ]
        });
        let entries = parse_entries(EntryKind::Timetable, &payload).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].date, day(2));
        assert_eq!(entries[1].date, day(3));
        assert_eq!(entries[1].payload["title"], "Math");
    }

    #[test]
    fn test_time_registration_days() {
        let payload = json!({
            "days": [{"date": "2024-09-04", "startDateTime": "2024-09-04T07:30:00"}]
        });
        let entries = parse_entries(EntryKind::TimeRegistration, &payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::TimeRegistration);
    }

    #[test]
    fn test_unknown_shape_is_empty_not_error() {
        let entries = parse_entries(EntryKind::Timetable, &json!({"foo": 1})).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_scalar_payload_is_parse_error() {
        let err = parse_entries(EntryKind::Timetable, &json!("<html>")).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_parse_loose_date() {
        assert_eq!(parse_loose_date("2024-09-02 10:00:00"), Some(day(2)));
        assert_eq!(parse_loose_date("02/09/2024"), Some(day(2)));
        assert_eq!(parse_loose_date("yesterday"), None);
    }
}
