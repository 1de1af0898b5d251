use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use crate::error::{FluxError, FluxResult};

pub type NodeInputs = Map<String, Value>;
pub type Payload = Map<String, Value>;

/// `seed` value meaning "let the API pick one".
pub const SEED_SENTINEL: i64 = -1;
pub const DIMENSION_MULTIPLE: i64 = 32;
pub const REGION_INPUT: &str = "region";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String { multiline: bool },
    Int { min: Option<i64>, max: Option<i64> },
    Float { min: f64, max: f64 },
    Bool,
    Choice { options: Vec<String> },
}

/// When a field is left out of the request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Omit {
    Never,
    WhenEmpty,
    WhenEquals(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub default: Value,
    pub required: bool,
    pub omit: Omit,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind, default: Value) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default,
            required: true,
            omit: Omit::Never,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn omit(mut self, omit: Omit) -> Self {
        self.omit = omit;
        self
    }

    /// Type check only; ranges and choices are the host's job (see
    /// [`FieldSpec::check_constraints`]).
    pub fn coerce(&self, value: &Value) -> FluxResult<Value> {
        let coerced = match &self.kind {
            FieldKind::String { .. } | FieldKind::Choice { .. } => {
                value.as_str().map(|text| Value::String(text.to_string()))
            }
            FieldKind::Int { .. } => as_integer(value).map(|number| Value::Number(number.into())),
            FieldKind::Float { .. } => value
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number),
            FieldKind::Bool => value.as_bool().map(Value::Bool),
        };
        coerced.ok_or_else(|| {
            FluxError::invalid_input(&self.name, format!("expected {}, got {value}", self.kind_label()))
        })
    }

    /// Parse a textual widget value (CLI `key=value`) into this field's type.
    pub fn parse_text(&self, raw: &str) -> FluxResult<Value> {
        let trimmed = raw.trim();
        let parsed = match &self.kind {
            FieldKind::String { .. } | FieldKind::Choice { .. } => Some(Value::String(raw.to_string())),
            FieldKind::Int { .. } => trimmed.parse::<i64>().ok().map(|value| json!(value)),
            FieldKind::Float { .. } => trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            FieldKind::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
                _ => None,
            },
        };
        parsed.ok_or_else(|| {
            FluxError::invalid_input(&self.name, format!("expected {}, got '{raw}'", self.kind_label()))
        })
    }

    /// Range and choice checks the host widgets would enforce.
    pub fn check_constraints(&self, value: &Value) -> FluxResult<()> {
        let value = self.coerce(value)?;
        match &self.kind {
            FieldKind::Int { min, max } => {
                let number = value.as_i64().unwrap_or_default();
                if min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max) {
                    return Err(FluxError::invalid_input(
                        &self.name,
                        format!("{number} outside {}", range_text(*min, *max)),
                    ));
                }
            }
            FieldKind::Float { min, max } => {
                let number = value.as_f64().unwrap_or_default();
                if number < *min || number > *max {
                    return Err(FluxError::invalid_input(
                        &self.name,
                        format!("{number} outside [{min}, {max}]"),
                    ));
                }
            }
            FieldKind::Choice { options } => {
                let choice = value.as_str().unwrap_or_default();
                if !options.iter().any(|option| option == choice) {
                    return Err(FluxError::invalid_input(
                        &self.name,
                        format!("'{choice}' not one of {}", options.join(", ")),
                    ));
                }
            }
            FieldKind::String { .. } | FieldKind::Bool => {}
        }
        Ok(())
    }

    fn kind_label(&self) -> &'static str {
        match self.kind {
            FieldKind::String { .. } => "string",
            FieldKind::Int { .. } => "integer",
            FieldKind::Float { .. } => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Choice { .. } => "choice",
        }
    }

    fn is_omitted(&self, value: &Value) -> bool {
        match self.omit {
            Omit::Never => value.is_null(),
            Omit::WhenEmpty => value.is_null() || value.as_str().is_some_and(|text| text.trim().is_empty()),
            Omit::WhenEquals(sentinel) => value.is_null() || value.as_i64() == Some(sentinel),
        }
    }
}

/// What invoking a node does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAction {
    Generate { endpoint: String },
    CreateConfig,
    FinetuneCreate,
    FinetuneStatus,
    FinetuneList,
    FinetuneDetails,
    FinetuneDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutput {
    Image,
    Text { names: Vec<String> },
    Config,
}

/// Declarative description of one node; every generation variant runs
/// through the same submit/poll/materialize pipeline using `action`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSpec {
    pub name: String,
    pub display_name: String,
    pub category: String,
    pub action: NodeAction,
    pub fields: Vec<FieldSpec>,
    pub accepts_region: bool,
    pub accepts_config: bool,
    pub output: NodeOutput,
}

impl NodeSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn endpoint(&self) -> Option<&str> {
        match &self.action {
            NodeAction::Generate { endpoint } => Some(endpoint.as_str()),
            _ => None,
        }
    }

    /// Fill defaults, type-check, apply omission rules and the
    /// width/height multiple-of-32 precondition.
    pub fn build_payload(&self, inputs: &NodeInputs) -> FluxResult<Payload> {
        let mut payload = Payload::new();
        for field in &self.fields {
            let value = inputs
                .get(&field.name)
                .filter(|value| !value.is_null())
                .unwrap_or(&field.default);
            if value.is_null() {
                if field.required {
                    return Err(FluxError::invalid_input(&field.name, "missing required input"));
                }
                continue;
            }
            let value = field.coerce(value)?;
            if field.is_omitted(&value) {
                continue;
            }
            payload.insert(field.name.clone(), value);
        }

        if let (Some(width), Some(height)) = (
            payload.get("width").and_then(Value::as_i64),
            payload.get("height").and_then(Value::as_i64),
        ) {
            check_multiple_of_32(width, height)?;
        }
        Ok(payload)
    }

    /// Host-side widget constraints for every supplied input.
    pub fn validate(&self, inputs: &NodeInputs) -> FluxResult<()> {
        for field in &self.fields {
            if let Some(value) = inputs.get(&field.name).filter(|value| !value.is_null()) {
                field.check_constraints(value)?;
            }
        }
        if self.accepts_region {
            if let Some(region) = inputs.get(REGION_INPUT) {
                region_field().check_constraints(region)?;
            }
        }
        Ok(())
    }

    /// Region requested by this node's own input, when it has one.
    pub fn region_input(&self, inputs: &NodeInputs) -> Option<String> {
        if !self.accepts_region {
            return None;
        }
        inputs
            .get(REGION_INPUT)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| region_field().default.as_str().map(str::to_string))
    }

    /// Input schema for host widget rendering, split like the host expects
    /// into required and optional groups.
    pub fn input_schema(&self) -> Value {
        let mut required = Map::new();
        let mut optional = Map::new();
        for field in &self.fields {
            let target = if field.required { &mut required } else { &mut optional };
            target.insert(field.name.clone(), field_schema(field));
        }
        if self.accepts_region {
            required.insert(REGION_INPUT.to_string(), field_schema(&region_field()));
        }
        if self.accepts_config {
            optional.insert("config".to_string(), json!({"type": "bfl_config"}));
        }
        json!({
            "name": self.name,
            "display_name": self.display_name,
            "category": self.category,
            "required": required,
            "optional": optional,
            "output": self.output,
        })
    }
}

pub fn check_multiple_of_32(width: i64, height: i64) -> FluxResult<()> {
    if width % DIMENSION_MULTIPLE != 0 || height % DIMENSION_MULTIPLE != 0 {
        return Err(FluxError::Validation(format!(
            "Width {width} and height {height} must be multiples of {DIMENSION_MULTIPLE}."
        )));
    }
    Ok(())
}

pub(crate) fn region_field() -> FieldSpec {
    FieldSpec::new(
        REGION_INPUT,
        FieldKind::Choice {
            options: vec!["us".to_string(), "eu".to_string()],
        },
        json!("us"),
    )
}

fn field_schema(field: &FieldSpec) -> Value {
    let mut schema = match serde_json::to_value(&field.kind) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    schema.insert("default".to_string(), field.default.clone());
    Value::Object(schema)
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|number| number.fract() == 0.0 && number.abs() < i64::MAX as f64)
            .map(|number| number as i64)
    })
}

fn range_text(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("[{min}, {max}]"),
        (Some(min), None) => format!(">= {min}"),
        (None, Some(max)) => format!("<= {max}"),
        (None, None) => "any".to_string(),
    }
}
