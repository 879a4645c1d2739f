//! Reading the records a snippet runs against.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use jsonschema::Draft;
use serde_json::Value;
use snip_lang::{Record, Row};

const RECORD_SCHEMA: &str = include_str!("../../schemas/record.schema.json");

/// The two records the CLI uses when none are given.
pub fn sample_records() -> Vec<Record> {
    let now = Utc::now();
    vec![
        Record::new(now, vec![Row::new().with("foo", 1).with("bar", 2)]),
        Record::new(now, vec![Row::new().with("foo", 3).with("bar", 4)]),
    ]
}

/// Load a JSON file holding one record or an array of records.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_records(&raw).with_context(|| format!("load records from {}", path.display()))
}

/// Parse and validate records: schema conformance, then typed decoding.
pub fn parse_records(raw: &str) -> Result<Vec<Record>> {
    let instance: Value = serde_json::from_str(raw).context("parse records json")?;
    validate_schema(&instance)?;
    let records = match instance {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value(item).with_context(|| format!("decode record {i}"))
            })
            .collect::<Result<Vec<Record>>>()?,
        single => vec![serde_json::from_value(single).context("decode record")?],
    };
    Ok(records)
}

/// Validate against the embedded record schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(RECORD_SCHEMA).context("parse record schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("invalid record schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "records schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_lang::Value as FieldValue;

    #[test]
    fn samples_match_the_classic_pair() {
        let records = sample_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rows[0].get("foo"), Some(&FieldValue::Int(1)));
        assert_eq!(records[1].rows[0].get("bar"), Some(&FieldValue::Int(4)));
    }

    #[test]
    fn single_object_is_one_record() {
        let records =
            parse_records(r#"{"time":"2024-01-02T03:04:05Z","rows":[{"foo":1,"name":"x"}]}"#)
                .expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].rows[0].get("name"),
            Some(&FieldValue::Str("x".into()))
        );
    }

    #[test]
    fn array_of_records_keeps_order() {
        let raw = r#"[
            {"time":"2024-01-02T03:04:05Z","rows":[{"n":1}]},
            {"time":"2024-01-02T03:04:06+02:00"}
        ]"#;
        let records = parse_records(raw).expect("parse");
        assert_eq!(records.len(), 2);
        assert!(records[1].rows.is_empty());
    }

    #[test]
    fn nested_values_are_rejected_by_schema() {
        let err = parse_records(r#"{"time":"2024-01-02T03:04:05Z","rows":[{"foo":[1,2]}]}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn missing_time_is_rejected() {
        let err = parse_records(r#"{"rows":[]}"#).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn load_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("records.json");
        fs::write(&path, "[]").expect("write");
        assert!(load_records(&path).expect("load").is_empty());

        let err = load_records(&temp.path().join("absent.json")).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }
}
