use super::record::{ScheduleRecord, ScheduleStatus};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Read access to whatever is stored per identity.
///
/// Implemented for typed [`ScheduleRecord`]s and for raw JSON objects as
/// they come out of the store.
pub trait ScheduleView {
    /// Explicit status, if the record carries one.
    fn status(&self) -> Option<ScheduleStatus>;

    /// Whether the record holds any schedule data.
    fn has_schedule(&self) -> bool;

    /// Whether the record holds anything at all.
    fn is_empty_record(&self) -> bool {
        false
    }

    /// Status after applying the legacy default: a record with no status
    /// but a populated schedule counts as fresh.
    fn effective_status(&self) -> ScheduleStatus {
        match self.status() {
            Some(status) => status,
            None if self.has_schedule() => ScheduleStatus::Fresh,
            None => ScheduleStatus::Missing,
        }
    }
}

impl ScheduleView for ScheduleRecord {
    fn status(&self) -> Option<ScheduleStatus> {
        self.status
    }

    fn has_schedule(&self) -> bool {
        !self.entries.is_empty()
    }
}

impl ScheduleView for JsonValue {
    fn status(&self) -> Option<ScheduleStatus> {
        let status = self.get("schedule_status")?;
        if is_blank(status) {
            return None;
        }
        // Anything set but unrecognised counts as missing.
        let parsed = status.as_str().and_then(ScheduleStatus::parse);
        Some(parsed.unwrap_or(ScheduleStatus::Missing))
    }

    fn has_schedule(&self) -> bool {
        match self.get("schedule") {
            Some(JsonValue::Array(items)) => !items.is_empty(),
            Some(JsonValue::Object(map)) => !map.is_empty(),
            _ => false,
        }
    }

    fn is_empty_record(&self) -> bool {
        match self {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }
}

/// Null, false, zero and empty values read as "no status set".
fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completeness {
    /// True iff `missing` and `stale` are both empty.
    pub complete: bool,
    pub missing: Vec<String>,
    pub stale: Vec<String>,
}

/// Checks whether every identity has fresh schedule data.
///
/// Identities with no record, an empty record, or a `missing` status land in
/// `missing`; `cached` ones land in `stale`. Both lists follow the order of
/// `identity_ids`.
pub fn evaluate<S, R>(identity_ids: &[S], data: &HashMap<String, R>) -> Completeness
where
    S: AsRef<str>,
    R: ScheduleView,
{
    let mut missing = Vec::new();
    let mut stale = Vec::new();

    for id in identity_ids {
        let id = id.as_ref();
        let status = match data.get(id) {
            Some(record) if !record.is_empty_record() => record.effective_status(),
            _ => ScheduleStatus::Missing,
        };
        match status {
            ScheduleStatus::Fresh => {}
            ScheduleStatus::Cached => stale.push(id.to_string()),
            ScheduleStatus::Missing => missing.push(id.to_string()),
        }
    }

    Completeness {
        complete: missing.is_empty() && stale.is_empty(),
        missing,
        stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_data(value: JsonValue) -> HashMap<String, JsonValue> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_all_fresh_is_complete() {
        let data = json_data(json!({
            "a": {"schedule_status": "fresh", "schedule": []},
            "b": {"schedule_status": "fresh", "schedule": [1]},
        }));
        let result = evaluate(&["a", "b"], &data);

        assert_eq!(
            result,
            Completeness {
                complete: true,
                missing: vec![],
                stale: vec![]
            }
        );
    }

    #[test]
    fn test_mixed_statuses() {
        let data = json_data(json!({
            "a": {"schedule_status": "fresh"},
            "b": {"schedule_status": "cached", "schedule": [1]},
            "c": {"schedule_status": "missing"},
        }));
        let result = evaluate(&["a", "b", "c"], &data);

        assert!(!result.complete);
        assert_eq!(result.missing, vec!["c"]);
        assert_eq!(result.stale, vec!["b"]);
    }

    #[test]
    fn test_legacy_record_with_schedule_is_fresh() {
        let data = json_data(json!({"legacy": {"schedule": [1]}}));
        assert!(evaluate(&["legacy"], &data).complete);
    }

    #[test]
    fn test_legacy_record_without_schedule_is_missing() {
        let data = json_data(json!({"legacy": {"schedule": []}, "blank": {}}));
        let result = evaluate(&["legacy", "blank", "absent"], &data);
        assert_eq!(result.missing, vec!["legacy", "blank", "absent"]);
    }

    #[test]
    fn test_output_follows_input_order() {
        let data = json_data(json!({
            "z": {"schedule_status": "cached"},
            "y": {"schedule_status": "cached"},
        }));
        let result = evaluate(&["z", "x", "y"], &data);
        assert_eq!(result.stale, vec!["z", "y"]);
        assert_eq!(result.missing, vec!["x"]);
    }

    #[test]
    fn test_non_string_status_is_missing() {
        let data = json_data(json!({
            "flag": {"schedule_status": true, "schedule": [1]},
            "code": {"schedule_status": 2, "schedule": [1]},
            "unset": {"schedule_status": null, "schedule": [1]},
        }));
        let result = evaluate(&["flag", "code", "unset"], &data);
        assert_eq!(result.missing, vec!["flag", "code"]);
        assert!(result.stale.is_empty());
    }

    #[test]
    fn test_typed_records() {
        let mut cached = ScheduleRecord::fresh("b", vec![]);
        cached.demote();
        let data: HashMap<String, ScheduleRecord> = [
            ("a".to_string(), ScheduleRecord::fresh("a", vec![])),
            ("b".to_string(), cached),
        ]
        .into_iter()
        .collect();

        let result = evaluate(&["a".to_string(), "b".to_string()], &data);
        assert_eq!(result.stale, vec!["b"]);
        assert!(result.missing.is_empty());
    }
}
