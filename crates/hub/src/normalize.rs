//! Telemetry normalization.
//!
//! Nodes in the field publish several historical payload shapes (Indonesian
//! field names from the original firmware, English names from later builds,
//! a nested `gas` object from the multi-gas variant). Every shape is resolved
//! into one canonical [`TelemetryRecord`] through an ordered candidate table.
//! Each table row ends with the canonical name itself so a record that is
//! already canonical normalizes to itself.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use time::macros::format_description;
use time::OffsetDateTime;

type Path = &'static [&'static str];

const GARDEN_ID: &[Path] = &[&["id_kebun"], &["garden_id"]];
const TEMPERATURE: &[Path] = &[&["suhu"], &["temperature"]];
const HUMIDITY_AIR: &[Path] = &[&["kelembapan_udara"], &["humidity"], &["humidity_air"]];
const HUMIDITY_SOIL: &[Path] = &[&["kelembapan_tanah"], &["humidity_soil"]];
const LIGHT: &[Path] = &[&["cahaya"], &["ldr"], &["light"]];
const CO2: &[Path] = &[&["co2"], &["gas", "CO2"], &["gas", "co2"]];

/// The schema every stored document follows. Absent readings are omitted
/// from the JSON, never written as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub garden_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_air: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_soil: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2: Option<Number>,
    pub timestamp: String,
}

impl TelemetryRecord {
    /// Canonical names of the readings a manual submission must carry but
    /// this record lacks.
    pub fn missing_readings(&self) -> Vec<&'static str> {
        [
            ("temperature", &self.temperature),
            ("humidity_air", &self.humidity_air),
            ("humidity_soil", &self.humidity_soil),
            ("light", &self.light),
            ("co2", &self.co2),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    default_garden_id: String,
}

impl Normalizer {
    pub fn new(default_garden_id: &str) -> Self {
        Self {
            default_garden_id: default_garden_id.to_string(),
        }
    }

    pub fn normalize(&self, raw: &Value) -> TelemetryRecord {
        self.normalize_at(raw, OffsetDateTime::now_utc())
    }

    /// Same as [`normalize`](Self::normalize) with an explicit clock.
    pub fn normalize_at(&self, raw: &Value, now: OffsetDateTime) -> TelemetryRecord {
        TelemetryRecord {
            garden_id: resolve(raw, GARDEN_ID, as_garden_id)
                .unwrap_or_else(|| self.default_garden_id.clone()),
            temperature: resolve(raw, TEMPERATURE, as_number),
            humidity_air: resolve(raw, HUMIDITY_AIR, as_number),
            humidity_soil: resolve(raw, HUMIDITY_SOIL, as_number),
            light: resolve(raw, LIGHT, as_number),
            co2: resolve(raw, CO2, as_number),
            timestamp: raw
                .get("timestamp")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format_timestamp(now)),
        }
    }
}

/// First candidate that exists, is not null and converts wins. A key that is
/// present but null does not stop the search: `{"suhu": null,
/// "temperature": 28}` resolves to 28, not to nothing.
fn resolve<T>(raw: &Value, candidates: &[Path], convert: fn(&Value) -> Option<T>) -> Option<T> {
    candidates
        .iter()
        .filter_map(|path| lookup(raw, path))
        .find_map(convert)
}

fn lookup<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = raw;
    for key in path {
        cur = cur.get(*key)?;
    }
    (!cur.is_null()).then_some(cur)
}

fn as_number(v: &Value) -> Option<Number> {
    match v {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => parse_number(s.trim()),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i.into());
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

fn as_garden_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `2024-05-01T07:30:00Z`
pub fn format_timestamp(t: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    t.to_offset(time::UtcOffset::UTC)
        .format(fmt)
        .unwrap_or_else(|_| t.unix_timestamp().to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 07:30:00 UTC);
    const NOW_STR: &str = "2024-05-01T07:30:00Z";

    fn norm(raw: Value) -> TelemetryRecord {
        Normalizer::new("KBG001").normalize_at(&raw, NOW)
    }

    fn to_json(r: &TelemetryRecord) -> Value {
        serde_json::to_value(r).unwrap()
    }

    // -- Aliases ----------------------------------------------------------

    #[test]
    fn device_payload_maps_to_canonical() {
        let r = norm(json!({
            "id_kebun": "KBG002",
            "suhu": 31.5,
            "kelembapan_udara": 70,
            "kelembapan_tanah": 56,
            "cahaya": 2100,
            "co2": 195.36
        }));
        assert_eq!(
            to_json(&r),
            json!({
                "garden_id": "KBG002",
                "temperature": 31.5,
                "humidity_air": 70,
                "humidity_soil": 56,
                "light": 2100,
                "co2": 195.36,
                "timestamp": NOW_STR
            })
        );
    }

    #[test]
    fn english_variant_maps_to_same_fields() {
        let a = norm(json!({"suhu": 30, "kelembapan_udara": 55, "cahaya": 80}));
        let b = norm(json!({"temperature": 30, "humidity": 55, "ldr": 80}));
        assert_eq!(a, b);
    }

    #[test]
    fn nested_gas_variants() {
        assert_eq!(norm(json!({"gas": {"CO2": 410}})).co2, Some(410.into()));
        assert_eq!(norm(json!({"gas": {"co2": 400.5}})).co2, Number::from_f64(400.5));
        assert_eq!(norm(json!({"gas": 12})).co2, None);
    }

    #[test]
    fn first_candidate_wins() {
        let r = norm(json!({"suhu": 25, "temperature": 99}));
        assert_eq!(r.temperature, Some(25.into()));
        let r = norm(json!({"co2": 1, "gas": {"CO2": 2, "co2": 3}}));
        assert_eq!(r.co2, Some(1.into()));
    }

    #[test]
    fn present_null_alias_does_not_shadow_later_alias() {
        // A null first alias must not win over a real value further down.
        let r = norm(json!({"suhu": null, "temperature": 28}));
        assert_eq!(r.temperature, Some(28.into()));
        let r = norm(json!({"kelembapan_udara": null, "humidity": 61.5}));
        assert_eq!(r.humidity_air, Some(Number::from_f64(61.5).unwrap()));
        let r = norm(json!({"co2": null}));
        assert_eq!(r.co2, None);
        assert!(to_json(&r).get("co2").is_none());
    }

    // -- Types ------------------------------------------------------------

    #[test]
    fn numeric_strings_are_accepted() {
        let r = norm(json!({"suhu": " 29.5 ", "cahaya": "80"}));
        assert_eq!(r.temperature, Number::from_f64(29.5));
        assert_eq!(r.light, Some(80.into()));
    }

    #[test]
    fn wrong_types_count_as_absent() {
        let r = norm(json!({"suhu": "hot", "cahaya": true, "co2": [1, 2]}));
        assert_eq!(r.temperature, None);
        assert_eq!(r.light, None);
        assert_eq!(r.co2, None);
    }

    #[test]
    fn numeric_garden_id_is_stringified() {
        assert_eq!(norm(json!({"id_kebun": 7})).garden_id, "7");
        assert_eq!(norm(json!({"garden_id": "KBG009"})).garden_id, "KBG009");
        assert_eq!(norm(json!({"id_kebun": ""})).garden_id, "KBG001");
    }

    // -- Defaults ---------------------------------------------------------

    #[test]
    fn empty_object_gets_only_defaults() {
        assert_eq!(
            to_json(&norm(json!({}))),
            json!({"garden_id": "KBG001", "timestamp": NOW_STR})
        );
    }

    #[test]
    fn non_object_input_is_total() {
        for raw in [json!(null), json!(42), json!("text"), json!([1, 2, 3])] {
            let r = norm(raw);
            assert_eq!(r.garden_id, "KBG001");
            assert_eq!(r.timestamp, NOW_STR);
            assert!(r.missing_readings().len() == 5);
        }
    }

    #[test]
    fn supplied_timestamp_is_kept() {
        let r = norm(json!({"timestamp": "2023-01-01T00:00:00Z"}));
        assert_eq!(r.timestamp, "2023-01-01T00:00:00Z");
        let r = norm(json!({"timestamp": ""}));
        assert_eq!(r.timestamp, NOW_STR);
        let r = norm(json!({"timestamp": 1700000000}));
        assert_eq!(r.timestamp, NOW_STR);
    }

    #[test]
    fn configured_default_garden() {
        let r = Normalizer::new("KBG042").normalize_at(&json!({}), NOW);
        assert_eq!(r.garden_id, "KBG042");
    }

    // -- Idempotence ------------------------------------------------------

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            json!({}),
            json!({"suhu": 30, "kelembapan_udara": 55, "kelembapan_tanah": 44, "cahaya": 80}),
            json!({"temperature": "21.5", "humidity": 40, "ldr": 12, "gas": {"CO2": 380}}),
            json!({"id_kebun": 3, "timestamp": "2020-02-02T02:02:02Z", "co2": 5}),
        ];
        for raw in inputs {
            let once = norm(raw);
            let twice = norm(to_json(&once));
            assert_eq!(once, twice);
        }
    }

    // -- Validation helper --------------------------------------------------

    #[test]
    fn missing_readings_lists_canonical_names() {
        let r = norm(json!({"suhu": 30, "kelembapan_udara": 55, "cahaya": 80, "co2": 400}));
        assert_eq!(r.missing_readings(), vec!["humidity_soil"]);
    }

    #[test]
    fn timestamp_format() {
        assert_eq!(
            format_timestamp(datetime!(2024-12-31 23:59:59 UTC)),
            "2024-12-31T23:59:59Z"
        );
    }
}
