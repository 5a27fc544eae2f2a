//! Lenient deserializers for job config values.
//!
//! The job generator writes most scalars as strings (`"1"`, `"0"`, `"600"`)
//! and lists either as JSON arrays or comma-separated strings.

use std::fmt::Display;
use std::str::FromStr;

use serde::de::{Deserializer, Error};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(u64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrText {
    List(Vec<Scalar>),
    Text(String),
}

fn parse_number<T, E>(raw: &str) -> Result<T, E>
where
    T: FromStr,
    T::Err: Display,
    E: Error,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| E::custom(format!("invalid number '{}': {}", raw, e)))
}

/// `true`/`false`, `1`/`0`, `"1"`/`"0"`, `"true"`/`"false"`.
pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Bool(b) => Ok(b),
        Scalar::Int(n) => Ok(n != 0),
        Scalar::Float(f) => Ok(f != 0.0),
        Scalar::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(D::Error::custom(format!("invalid flag '{}'", other))),
        },
    }
}

/// A number given as a JSON number or a numeric string.
pub fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = Scalar::deserialize(deserializer)?.into_text();
    parse_number::<T, D::Error>(&raw)
}

/// Like [`number`], with `null` and `""` mapping to `None`.
pub fn optional_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Option::<Scalar>::deserialize(deserializer)? {
        None => Ok(None),
        Some(scalar) => {
            let raw = scalar.into_text();
            if raw.trim().is_empty() {
                Ok(None)
            } else {
                parse_number::<T, D::Error>(&raw).map(Some)
            }
        }
    }
}

/// A JSON array of scalars or a comma-separated string.
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ListOrText::deserialize(deserializer)? {
        ListOrText::List(items) => items
            .into_iter()
            .map(|s| s.into_text().trim().to_string())
            .collect(),
        ListOrText::Text(text) => split_list(&text),
    })
}

/// A list of numbers in any of the shapes accepted by [`string_list`].
pub fn number_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    string_list(deserializer)?
        .iter()
        .map(|raw| parse_number::<T, D::Error>(raw))
        .collect()
}

/// A list, a comma-separated string, or an object whose keys are the items.
pub fn key_set<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum KeySet {
        List(Vec<String>),
        Map(std::collections::BTreeMap<String, serde_json::Value>),
        Text(String),
    }

    Ok(match KeySet::deserialize(deserializer)? {
        KeySet::List(items) => items.into_iter().map(|s| s.trim().to_string()).collect(),
        KeySet::Map(map) => map.into_keys().collect(),
        KeySet::Text(text) => split_list(&text),
    })
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "flag")]
        enabled: bool,
        #[serde(deserialize_with = "number")]
        timeout: u64,
        #[serde(default, deserialize_with = "optional_number")]
        cutoff: Option<u64>,
        #[serde(deserialize_with = "string_list")]
        names: Vec<String>,
        #[serde(deserialize_with = "number_list")]
        replicas: Vec<u32>,
        #[serde(deserialize_with = "key_set")]
        formats: Vec<String>,
    }

    #[test]
    fn test_string_encoded_values() {
        let sample: Sample = serde_json::from_str(
            r#"{"enabled": "1", "timeout": "600", "cutoff": "", "names": "qvina, smina",
                "replicas": ["2", 1], "formats": {"csv.gz": 1, "parquet": 1}}"#,
        )
        .unwrap();
        assert!(sample.enabled);
        assert_eq!(sample.timeout, 600);
        assert_eq!(sample.cutoff, None);
        assert_eq!(sample.names, vec!["qvina", "smina"]);
        assert_eq!(sample.replicas, vec![2, 1]);
        assert_eq!(sample.formats, vec!["csv.gz", "parquet"]);
    }

    #[test]
    fn test_native_json_values() {
        let sample: Sample = serde_json::from_str(
            r#"{"enabled": false, "timeout": 90, "cutoff": 5, "names": ["a"],
                "replicas": [3], "formats": ["parquet"]}"#,
        )
        .unwrap();
        assert!(!sample.enabled);
        assert_eq!(sample.timeout, 90);
        assert_eq!(sample.cutoff, Some(5));
        assert_eq!(sample.replicas, vec![3]);
        assert_eq!(sample.formats, vec!["parquet"]);
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let result: Result<Sample, _> = serde_json::from_str(
            r#"{"enabled": "maybe", "timeout": 1, "names": [], "replicas": [], "formats": []}"#,
        );
        assert!(result.is_err());
    }
}
