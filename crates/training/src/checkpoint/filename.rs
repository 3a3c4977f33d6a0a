//! Checkpoint file-name templates.
//!
//! A template is literal text mixed with `{name}`, `{name:0Nd}` and `{name:.Nf}`
//! placeholders. Each placeholder renders as `name=value`, so `"{epoch:02d}"`
//! becomes `epoch=03`. `epoch` and `step` come from the trainer; any other name
//! is looked up among the logged metrics and renders as zero when absent.

use std::{fmt, path::Path};

use crate::{metrics::MetricMap, TrainingError};

pub const DEFAULT_TEMPLATE: &str = "{epoch}-{step}";

#[derive(Debug, Clone, PartialEq)]
pub struct FilenameTemplate {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field { name: String, format: FieldFormat },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldFormat {
    Plain,
    ZeroPadded(usize),
    Fixed(usize),
}

impl FilenameTemplate {
    pub fn parse(raw: &str) -> Result<Self, TrainingError> {
        let invalid = |reason: String| {
            TrainingError::validation(vec![format!(
                "runtime.checkpoint.filename '{raw}' is invalid: {reason}"
            )])
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        body.push(inner);
                    }
                    if !closed {
                        return Err(invalid("unclosed '{'".into()));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_field(&body).map_err(invalid)?);
                }
                '}' => return Err(invalid("unmatched '}'".into())),
                '/' | '\\' => return Err(invalid("path separators are not allowed".into())),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err(invalid("template is empty".into()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// File stem (no extension) for a checkpoint taken at `epoch`/`step`.
    pub fn render(&self, epoch: usize, step: usize, metrics: &MetricMap) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { name, format } => {
                    out.push_str(name);
                    out.push('=');
                    let value = match name.as_str() {
                        "epoch" => FieldValue::Integer(epoch as u64),
                        "step" => FieldValue::Integer(step as u64),
                        other => FieldValue::Float(metrics.get_by_name(other).unwrap_or(0.0)),
                    };
                    out.push_str(&value.format(*format));
                }
            }
        }
        out
    }
}

impl Default for FilenameTemplate {
    fn default() -> Self {
        Self {
            raw: DEFAULT_TEMPLATE.to_string(),
            segments: vec![
                Segment::Field {
                    name: "epoch".into(),
                    format: FieldFormat::Plain,
                },
                Segment::Literal("-".into()),
                Segment::Field {
                    name: "step".into(),
                    format: FieldFormat::Plain,
                },
            ],
        }
    }
}

impl fmt::Display for FilenameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

enum FieldValue {
    Integer(u64),
    Float(f64),
}

impl FieldValue {
    fn format(&self, format: FieldFormat) -> String {
        match (self, format) {
            (FieldValue::Integer(value), FieldFormat::Plain) => value.to_string(),
            (FieldValue::Integer(value), FieldFormat::ZeroPadded(width)) => {
                format!("{value:0width$}")
            }
            (FieldValue::Integer(value), FieldFormat::Fixed(precision)) => {
                format!("{:.precision$}", *value as f64)
            }
            (FieldValue::Float(value), FieldFormat::Plain) => value.to_string(),
            (FieldValue::Float(value), FieldFormat::ZeroPadded(width)) => {
                format!("{:0width$}", value.trunc() as i64)
            }
            (FieldValue::Float(value), FieldFormat::Fixed(precision)) => {
                format!("{value:.precision$}")
            }
        }
    }
}

fn parse_field(body: &str) -> Result<Segment, String> {
    let (name, style) = match body.split_once(':') {
        Some((name, style)) => (name.trim(), Some(style.trim())),
        None => (body.trim(), None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("bad placeholder name '{name}'"));
    }

    let format = match style {
        None => FieldFormat::Plain,
        Some(style) => {
            if let Some(width) = style.strip_suffix('d') {
                let width = width.trim_start_matches('0');
                let width = if width.is_empty() {
                    0
                } else {
                    width
                        .parse::<usize>()
                        .map_err(|_| format!("bad integer format '{style}'"))?
                };
                FieldFormat::ZeroPadded(width)
            } else if let Some(precision) =
                style.strip_prefix('.').and_then(|rest| rest.strip_suffix('f'))
            {
                FieldFormat::Fixed(
                    precision
                        .parse::<usize>()
                        .map_err(|_| format!("bad float format '{style}'"))?,
                )
            } else {
                return Err(format!("unsupported format '{style}'"));
            }
        }
    };

    Ok(Segment::Field {
        name: name.to_string(),
        format,
    })
}

/// Epoch encoded in a checkpoint file name (`...epoch=NN...`), if any.
pub fn parse_epoch(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let (_, rest) = stem.split_once("epoch=")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;

    #[test]
    fn zero_padded_epoch() {
        let template = FilenameTemplate::parse("{epoch:02d}").unwrap();
        assert_eq!(template.render(0, 12, &MetricMap::new()), "epoch=00");
        assert_eq!(template.render(4, 60, &MetricMap::new()), "epoch=04");
        assert_eq!(template.render(123, 0, &MetricMap::new()), "epoch=123");
    }

    #[test]
    fn default_template_uses_epoch_and_step() {
        let template = FilenameTemplate::default();
        assert_eq!(template, FilenameTemplate::parse(DEFAULT_TEMPLATE).unwrap());
        assert_eq!(template.render(1, 24, &MetricMap::new()), "epoch=1-step=24");
    }

    #[test]
    fn metric_placeholders_render_fixed_precision() {
        let metrics: MetricMap = [(Metric::ValLoss, 0.123456)].into_iter().collect();
        let template = FilenameTemplate::parse("model-{epoch:03d}-{val_loss:.2f}").unwrap();
        assert_eq!(template.render(7, 0, &metrics), "model-epoch=007-val_loss=0.12");

        let missing = FilenameTemplate::parse("{train_loss:.1f}").unwrap();
        assert_eq!(missing.render(0, 0, &metrics), "train_loss=0.0");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for raw in ["{epoch", "epoch}", "{}", "{epoch:x}", "a/{epoch}", ""] {
            assert!(FilenameTemplate::parse(raw).is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn epoch_is_parsed_back_from_names() {
        assert_eq!(parse_epoch(Path::new("/tmp/run/epoch=00.ckpt")), Some(0));
        assert_eq!(parse_epoch(Path::new("epoch=12-step=99.ckpt")), Some(12));
        assert_eq!(parse_epoch(Path::new("epoch=03-v1.ckpt")), Some(3));
        assert_eq!(parse_epoch(Path::new("last.ckpt")), None);
    }
}
