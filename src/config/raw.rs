//! Serde shapes of the on-disk configuration document.
//!
//! Almost everything is optional here; defaults and constraints live in
//! `validate`, which turns a [`RawConfig`] into a `BuildConfiguration`.
//!
//! Documents are first read as untyped values and checked against
//! [`DOCUMENT`]. Unknown keys and values of the wrong type become field
//! problems and are dropped, so a single typo never hides the rest of the
//! report. Only a syntax error fails the whole document.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ConfigValidationError, FieldError};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub hardware: RawHardware,
    #[serde(default)]
    pub encryption: RawEncryption,
    #[serde(default)]
    pub packages: RawPackages,
    pub user: Option<RawUser>,
    #[serde(default)]
    pub first_boot: RawFirstBoot,
    #[serde(default)]
    pub network: RawNetwork,
    pub iso_label: Option<String>,
    pub iso_filename: Option<String>,
    /// Unknown keys and wrongly typed values found while reading.
    #[serde(skip)]
    pub shape_problems: Vec<FieldError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHardware {
    pub vendor: Option<String>,
    pub target_ssd: Option<bool>,
    pub disk_size_min_gb: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEncryption {
    pub enabled: Option<bool>,
    pub passphrase: Option<String>,
    pub cipher: Option<String>,
    pub key_size: Option<i64>,
    pub hash: Option<String>,
    pub iter_time_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPackages {
    #[serde(default)]
    pub apt_packages: Vec<String>,
    #[serde(default)]
    pub snap_packages: Vec<String>,
    #[serde(default)]
    pub debs: Vec<RawAssetRef>,
    pub deb_target_dir: Option<String>,
}

/// A deb or script reference. `url` and `local_path` are mutually exclusive.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAssetRef {
    pub name: Option<String>,
    pub url: Option<String>,
    pub local_path: Option<String>,
    pub checksum: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawUser {
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
    pub sudo_nopasswd: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFirstBoot {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub scripts: Vec<RawAssetRef>,
    pub target_dir: Option<String>,
    pub timeout_seconds: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNetwork {
    pub dhcp: Option<bool>,
    pub hostname: Option<String>,
}

/// Expected type of a document value.
#[derive(Debug, Clone, Copy)]
enum Shape {
    Bool,
    Int,
    Str,
    List(&'static Shape),
    Table(&'static [(&'static str, Shape)]),
}

const ASSET_REF: Shape = Shape::Table(&[
    ("name", Shape::Str),
    ("url", Shape::Str),
    ("local_path", Shape::Str),
    ("checksum", Shape::Str),
    ("type", Shape::Str),
]);

/// Every key the document may carry, mirroring the structs above.
const DOCUMENT: Shape = Shape::Table(&[
    (
        "hardware",
        Shape::Table(&[
            ("vendor", Shape::Str),
            ("target_ssd", Shape::Bool),
            ("disk_size_min_gb", Shape::Int),
        ]),
    ),
    (
        "encryption",
        Shape::Table(&[
            ("enabled", Shape::Bool),
            ("passphrase", Shape::Str),
            ("cipher", Shape::Str),
            ("key_size", Shape::Int),
            ("hash", Shape::Str),
            ("iter_time_ms", Shape::Int),
        ]),
    ),
    (
        "packages",
        Shape::Table(&[
            ("apt_packages", Shape::List(&Shape::Str)),
            ("snap_packages", Shape::List(&Shape::Str)),
            ("debs", Shape::List(&ASSET_REF)),
            ("deb_target_dir", Shape::Str),
        ]),
    ),
    (
        "user",
        Shape::Table(&[
            ("username", Shape::Str),
            ("full_name", Shape::Str),
            ("password", Shape::Str),
            ("ssh_authorized_keys", Shape::List(&Shape::Str)),
            ("sudo_nopasswd", Shape::Bool),
        ]),
    ),
    (
        "first_boot",
        Shape::Table(&[
            ("enabled", Shape::Bool),
            ("scripts", Shape::List(&ASSET_REF)),
            ("target_dir", Shape::Str),
            ("timeout_seconds", Shape::Int),
        ]),
    ),
    (
        "network",
        Shape::Table(&[("dhcp", Shape::Bool), ("hostname", Shape::Str)]),
    ),
    ("iso_label", Shape::Str),
    ("iso_filename", Shape::Str),
]);

impl Shape {
    fn expected(self) -> &'static str {
        match self {
            Shape::Bool => "a boolean",
            Shape::Int => "an integer",
            Shape::Str => "a string",
            Shape::List(_) => "an array",
            Shape::Table(_) => "a table",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Shape::Bool, Value::Bool(_)) => true,
            (Shape::Int, Value::Number(n)) => n.is_i64(),
            (Shape::Str, Value::String(_)) => true,
            (Shape::List(_), Value::Array(_)) => true,
            (Shape::Table(_), Value::Object(_)) => true,
            _ => false,
        }
    }

    /// Stand-in for a rejected list element. Keeps later indices stable and
    /// deserializes to something validation treats as empty.
    fn placeholder(self) -> Value {
        match self {
            Shape::Table(_) => Value::Object(Map::new()),
            _ => Value::String(String::new()),
        }
    }
}

fn found(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "an integer",
        Value::Number(_) => "a float",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a table",
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// Check `value` against `shape`, stripping whatever does not fit.
///
/// Returns false when `value` itself has the wrong type; the caller decides
/// how to drop it.
fn conform(shape: Shape, path: &str, value: &mut Value, problems: &mut Vec<FieldError>) -> bool {
    if !shape.matches(value) {
        let field = if path.is_empty() { "<document>" } else { path };
        problems.push(FieldError::new(
            field,
            format!("expected {}, found {}", shape.expected(), found(value)),
        ));
        return false;
    }
    match (shape, value) {
        (Shape::Table(fields), Value::Object(map)) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                let path = child_path(path, &key);
                let Some((_, inner)) = fields.iter().find(|(name, _)| *name == key) else {
                    problems.push(FieldError::new(path, "unknown field"));
                    map.remove(&key);
                    continue;
                };
                let keep = match map.get_mut(&key) {
                    // JSON null reads as an absent key.
                    Some(Value::Null) | None => false,
                    Some(child) => conform(*inner, &path, child, problems),
                };
                if !keep {
                    map.remove(&key);
                }
            }
        }
        (Shape::List(inner), Value::Array(items)) => {
            for (i, item) in items.iter_mut().enumerate() {
                if !conform(*inner, &format!("{}[{}]", path, i), item, problems) {
                    *item = inner.placeholder();
                }
            }
        }
        _ => {}
    }
    true
}

impl RawConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigValidationError> {
        let value: Value = toml::from_str(text)
            .map_err(|e| ConfigValidationError::single("<document>", e.message().to_string()))?;
        Self::from_value(value)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigValidationError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ConfigValidationError::single("<document>", e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(mut value: Value) -> Result<Self, ConfigValidationError> {
        let mut problems = Vec::new();
        if !conform(DOCUMENT, "", &mut value, &mut problems) {
            return Err(ConfigValidationError { problems });
        }
        let mut raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| ConfigValidationError::single("<document>", e.to_string()))?;
        raw.shape_problems = problems;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_reported_by_path() {
        let raw = RawConfig::from_toml_str("[hardware]\nvendr = \"dell\"\ntarget_ssd = true\n")
            .unwrap();
        assert_eq!(
            raw.shape_problems,
            vec![FieldError::new("hardware.vendr", "unknown field")]
        );
        assert_eq!(raw.hardware.target_ssd, Some(true));
    }

    #[test]
    fn wrong_types_are_dropped_and_reported() {
        let raw = RawConfig::from_toml_str(
            "[encryption]\nkey_size = \"big\"\ncipher = \"aes-xts-plain64\"\n\
             [packages]\napt_packages = [\"git\", 5]\n",
        )
        .unwrap();
        let fields: Vec<&str> = raw.shape_problems.iter().map(|p| p.field.as_str()).collect();
        assert_eq!(fields, vec!["encryption.key_size", "packages.apt_packages[1]"]);
        assert_eq!(
            raw.shape_problems[0].message,
            "expected an integer, found a string"
        );
        assert_eq!(raw.encryption.key_size, None);
        assert_eq!(raw.encryption.cipher.as_deref(), Some("aes-xts-plain64"));
        assert_eq!(raw.packages.apt_packages, vec!["git".to_string(), String::new()]);
    }

    #[test]
    fn misshapen_list_entries_keep_their_index() {
        let raw = RawConfig::from_json_str(
            r#"{"packages":{"debs":["oops",{"url":"https://e.org/b.deb"}]}}"#,
        )
        .unwrap();
        assert!(raw.shape_problems[0].field == "packages.debs[0]");
        assert_eq!(raw.packages.debs.len(), 2);
        assert_eq!(raw.packages.debs[1].url.as_deref(), Some("https://e.org/b.deb"));
    }

    #[test]
    fn syntax_errors_fail_the_document() {
        let err = RawConfig::from_toml_str("[hardware\n").unwrap_err();
        assert!(err.mentions("<document>"));
        let err = RawConfig::from_json_str("[1, 2]").unwrap_err();
        assert_eq!(err.problems[0].message, "expected a table, found an array");
    }

    #[test]
    fn json_and_toml_parse_to_the_same_shape() {
        let from_toml = RawConfig::from_toml_str(
            "[network]\nhostname = \"box\"\n[[first_boot.scripts]]\nurl = \"https://e.org/a.sh\"\ntype = \"manual\"\n",
        )
        .unwrap();
        let from_json = RawConfig::from_json_str(
            r#"{"network":{"hostname":"box"},"first_boot":{"scripts":[{"url":"https://e.org/a.sh","type":"manual"}]}}"#,
        )
        .unwrap();
        assert_eq!(from_toml.network.hostname, from_json.network.hostname);
        assert_eq!(from_toml.first_boot.scripts.len(), 1);
        assert_eq!(
            from_json.first_boot.scripts[0].kind.as_deref(),
            Some("manual")
        );
    }
}
