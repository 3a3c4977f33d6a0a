//! `key.path=value` overrides applied on top of a loaded config.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::{TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Applies every override in order and re-validates the result.
pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[ConfigOverride],
) -> Result<TrainingConfig, TrainingError> {
    if overrides.is_empty() {
        return Ok(config);
    }

    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;
    for entry in overrides {
        let segments = parse_path(&entry.path)?;
        assign(&mut value, &segments, parse_value(&entry.value))?;
    }

    let config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("config is invalid after overrides: {err}"))
    })?;
    config.validate()?;
    Ok(config)
}

fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

/// `runtime.checkpoint.filename` or `model.hidden_dims[1]`.
fn parse_path(path: &str) -> Result<Vec<Segment>, TrainingError> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, index) = match part.split_once('[') {
            Some((key, rest)) => {
                let index = rest
                    .strip_suffix(']')
                    .and_then(|raw| raw.parse::<usize>().ok())
                    .ok_or_else(|| {
                        TrainingError::runtime(format!("invalid index in override path '{part}'"))
                    })?;
                (key, Some(index))
            }
            None => (part, None),
        };
        if key.is_empty() {
            return Err(TrainingError::runtime(format!(
                "override path '{path}' has an empty segment"
            )));
        }
        segments.push(Segment::Key(key.to_string()));
        segments.extend(index.map(Segment::Index));
    }
    Ok(segments)
}

fn assign(target: &mut Value, segments: &[Segment], new_value: Value) -> Result<(), TrainingError> {
    let Some((head, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    match head {
        Segment::Key(key) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let map = target.as_object_mut().ok_or_else(|| {
                TrainingError::runtime(format!("override segment '{key}' points into a non-object"))
            })?;
            let entry = map.entry(key.clone()).or_insert(Value::Null);
            assign(entry, rest, new_value)
        }
        Segment::Index(index) => {
            if target.is_null() {
                *target = Value::Array(Vec::new());
            }
            let array = target.as_array_mut().ok_or_else(|| {
                TrainingError::runtime(format!("override index [{index}] points into a non-array"))
            })?;
            if array.len() <= *index {
                array.resize(index + 1, Value::Null);
            }
            assign(&mut array[*index], rest, new_value)
        }
    }
}
