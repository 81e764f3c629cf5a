use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Case-insensitive field lookup on a JSON object.
pub fn get_ci<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// Locates the record array inside an upstream payload. The API wraps
/// collections inconsistently: raw arrays, `{data: [...]}`, the
/// reference-preserving `{"$values": [...]}` envelope, or some ad-hoc object
/// with a single array-valued field.
pub fn extract_records(payload: &Value) -> Vec<Value> {
    if let Some(items) = payload.as_array() {
        return items.clone();
    }

    if let Some(data) = get_ci(payload, "data") {
        if let Some(values) = get_ci(data, "$values").and_then(Value::as_array) {
            return values.clone();
        }
        if let Some(items) = data.as_array() {
            return items.clone();
        }
    }

    if let Some(values) = get_ci(payload, "$values").and_then(Value::as_array) {
        return values.clone();
    }

    if let Some(map) = payload.as_object() {
        for field in map.values() {
            if let Some(items) = field.as_array() {
                return items.clone();
            }
        }
    }

    Vec::new()
}

/// Single-record variant: unwraps a `data` or `objeto` envelope when present,
/// otherwise returns the object itself.
pub fn extract_single(payload: &Value) -> Option<Value> {
    if !payload.is_object() {
        return None;
    }
    for key in ["data", "objeto"] {
        if let Some(inner) = get_ci(payload, key) {
            if inner.is_object() {
                return Some(inner.clone());
            }
        }
    }
    Some(payload.clone())
}

/// First alias that holds a string value. Non-string fields never match.
pub fn get_string(record: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = get_ci(record, name).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

/// First alias that holds a number or a numeric string.
pub fn get_int(record: &Value, names: &[&str]) -> Option<i64> {
    for name in names {
        let Some(v) = get_ci(record, name) else {
            continue;
        };
        if let Some(i) = v.as_i64() {
            return Some(i);
        }
        if let Some(i) = v.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
            return Some(i);
        }
    }
    None
}

/// First alias that holds a bool, a 0/1 number, or a "true"/"false" string.
pub fn get_bool(record: &Value, names: &[&str]) -> Option<bool> {
    for name in names {
        let Some(v) = get_ci(record, name) else {
            continue;
        };
        if let Some(b) = v.as_bool() {
            return Some(b);
        }
        if let Some(b) = v.as_str().and_then(|s| s.trim().parse::<bool>().ok()) {
            return Some(b);
        }
        if let Some(i) = v.as_i64() {
            return Some(i != 0);
        }
    }
    None
}

/// First alias that parses as a date, normalized to UTC. Accepts ISO-ish
/// strings and integer Unix epoch seconds.
pub fn get_date(record: &Value, names: &[&str]) -> Option<DateTime<Utc>> {
    for name in names {
        let Some(v) = get_ci(record, name) else {
            continue;
        };
        if let Some(dt) = v.as_str().and_then(parse_date_str) {
            return Some(dt);
        }
        if let Some(epoch) = v.as_i64() {
            if let Some(dt) = DateTime::<Utc>::from_timestamp(epoch, 0) {
                return Some(dt);
            }
        }
    }
    None
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Timezone-less timestamps from the API are taken as UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(records: &[Value]) -> Vec<i64> {
        records
            .iter()
            .map(|r| get_int(r, &["id"]).unwrap_or(-1))
            .collect()
    }

    #[test]
    fn extract_records_handles_all_wrapper_shapes() {
        let rows = json!([{ "id": 1 }, { "id": 2 }]);
        let shapes = vec![
            rows.clone(),
            json!({ "data": rows.clone() }),
            json!({ "data": { "$values": rows.clone() } }),
            json!({ "$values": rows.clone() }),
            json!({ "exitoso": true, "items": rows.clone() }),
        ];
        for shape in shapes {
            assert_eq!(ids(&extract_records(&shape)), vec![1, 2], "shape {shape}");
        }
    }

    #[test]
    fn extract_records_degrades_to_empty() {
        assert!(extract_records(&json!({ "exitoso": true })).is_empty());
        assert!(extract_records(&json!("not a collection")).is_empty());
        assert!(extract_records(&json!(null)).is_empty());
    }

    #[test]
    fn extract_single_prefers_envelopes() {
        let wrapped = json!({ "data": { "id": 7 } });
        assert_eq!(extract_single(&wrapped), Some(json!({ "id": 7 })));
        let objeto = json!({ "Objeto": { "id": 8 } });
        assert_eq!(extract_single(&objeto), Some(json!({ "id": 8 })));
        let flat = json!({ "id": 9 });
        assert_eq!(extract_single(&flat), Some(flat.clone()));
        assert_eq!(extract_single(&json!([1, 2])), None);
    }

    #[test]
    fn accessors_match_case_insensitively() {
        let rec = json!({ "ContactId": 5, "IsOnline": true, "SentAt": "2024-03-01T10:00:00Z" });
        assert_eq!(get_int(&rec, &["contactId"]), Some(5));
        assert_eq!(get_bool(&rec, &["isOnline"]), Some(true));
        assert!(get_date(&rec, &["sentAt"]).is_some());
    }

    #[test]
    fn int_accessor_accepts_numeric_strings_only() {
        let rec = json!({ "id": "42", "other": "abc" });
        assert_eq!(get_int(&rec, &["id"]), Some(42));
        assert_eq!(get_int(&rec, &["other"]), None);
        assert_eq!(get_int(&rec, &["missing"]), None);
    }

    #[test]
    fn bool_accessor_accepts_numbers_and_strings() {
        let rec = json!({ "a": 1, "b": 0, "c": "true", "d": "false" });
        assert_eq!(get_bool(&rec, &["a"]), Some(true));
        assert_eq!(get_bool(&rec, &["b"]), Some(false));
        assert_eq!(get_bool(&rec, &["c"]), Some(true));
        assert_eq!(get_bool(&rec, &["d"]), Some(false));
        assert_eq!(get_bool(&rec, &["missing"]), None);
    }

    #[test]
    fn string_accessor_rejects_non_strings() {
        let rec = json!({ "name": 33, "nombre": "Ana" });
        assert_eq!(get_string(&rec, &["name", "nombre"]), Some("Ana".into()));
    }

    #[test]
    fn date_accessor_accepts_epoch_and_iso() {
        let rec = json!({ "a": 1709287200, "b": "2024-03-01T10:00:00Z", "c": "2024-03-01" });
        let epoch = get_date(&rec, &["a"]).unwrap();
        let iso = get_date(&rec, &["b"]).unwrap();
        assert_eq!(epoch, iso);
        let midnight = get_date(&rec, &["c"]).unwrap();
        assert_eq!(midnight.to_rfc3339(), "2024-03-01T00:00:00+00:00");
    }

    #[test]
    fn first_matching_alias_wins() {
        let rec = json!({ "sent_at": "2024-01-02T00:00:00Z", "timestamp": "2020-01-01T00:00:00Z" });
        let dt = get_date(&rec, &["sentAt", "sent_at", "timestamp"]).unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-02T00:00:00+00:00");
    }
}
