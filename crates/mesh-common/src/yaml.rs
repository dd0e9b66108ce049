//! YAML parsing utilities using yaml-rust2
//!
//! Rendered manifests are YAML; everything downstream works on
//! `serde_json::Value`. Parsing goes through yaml-rust2 and converts the tree.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Parse a multi-document YAML string into one Value per document.
///
/// Empty documents (a stray `---`, comment-only sections) are dropped.
pub fn parse_yaml_multi(input: &str) -> Result<Vec<Value>, Error> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization(format!("invalid YAML: {e}")))?;
    docs.into_iter()
        .map(yaml_to_json)
        .filter(|v| !matches!(v, Ok(Value::Null)))
        .collect()
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::serialization(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(Error::serialization("unsupported YAML key type")),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::serialization("YAML aliases not supported")),
        Yaml::BadValue => Err(Error::serialization("bad YAML value")),
    }
}

/// Render a value as YAML (used for `--crd` output)
pub fn to_yaml(value: &Value) -> Result<String, Error> {
    let mut out = String::new();
    let yaml = json_to_yaml(value);
    yaml_rust2::YamlEmitter::new(&mut out)
        .dump(&yaml)
        .map_err(|e| Error::serialization(format!("failed to emit YAML: {e}")))?;
    Ok(out)
}

fn json_to_yaml(value: &Value) -> Yaml {
    match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Yaml::Integer(i),
            None => Yaml::Real(n.to_string()),
        },
        Value::String(s) => Yaml::String(s.clone()),
        Value::Array(items) => Yaml::Array(items.iter().map(json_to_yaml).collect()),
        Value::Object(map) => Yaml::Hash(
            map.iter()
                .map(|(k, v)| (Yaml::String(k.clone()), json_to_yaml(v)))
                .collect(),
        ),
    }
}
