// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Render values.
//!
//! Typed input values handed to a concept. Raw values, be it JSON from a
//! previous render info or plain strings from the command line, are always
//! interpreted through the [`InputType`] the concept declares for them. A
//! value is never guessed from the shape of its raw form.

use crate::{
    concept::{ConceptInputs, InputKind, InputType},
    render::RenderError,
};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// One typed input value.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderValue {
    String(String),
    Map(Map<String, Value>),
    Int(i64),
    Bool(bool),
}

impl RenderValue {
    /// Type tag of value.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Map(_) => "map",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
        }
    }

    /// Value as template source code.
    ///
    /// Strings are quoted, everything else is a literal.
    pub fn to_ext_code(&self) -> String {
        match self {
            Self::String(_) => self.to_json().to_string(),
            _ => self.to_string(),
        }
    }

    /// Value as JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(value) => Value::String(value.clone()),
            Self::Map(value) => Value::Object(value.clone()),
            Self::Int(value) => Value::from(*value),
            Self::Bool(value) => Value::Bool(*value),
        }
    }

    /// Interpret JSON value as declared input type.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::ValueTypeNotSupported`] if the JSON value does
    ///   not have the declared type.
    /// - Return [`RenderError::InvalidSelection`] for select values that are
    ///   not a declared option.
    pub fn from_json(name: &str, value: &Value, input: &InputType) -> Result<Self> {
        let result = match (input.kind, value) {
            (InputKind::String | InputKind::Select, Value::String(value)) => {
                Self::String(value.clone())
            }
            (InputKind::Int, Value::Number(number)) if number.is_i64() => {
                Self::Int(number.as_i64().unwrap_or_default())
            }
            (InputKind::Bool, Value::Bool(value)) => Self::Bool(*value),
            (InputKind::Map, Value::Object(value)) => Self::Map(value.clone()),
            (kind, value) => {
                return Err(RenderError::ValueTypeNotSupported {
                    name: name.to_string(),
                    expected: kind,
                    found: json_type(value).to_string(),
                })
            }
        };
        result.check_selection(name, input)?;
        Ok(result)
    }

    /// Interpret raw text as declared input type.
    ///
    /// Maps are given as JSON objects.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::ValueTypeNotSupported`] if the text cannot be
    ///   read as the declared type.
    /// - Return [`RenderError::InvalidSelection`] for select values that are
    ///   not a declared option.
    pub fn parse(name: &str, raw: &str, input: &InputType) -> Result<Self> {
        let mismatch = || RenderError::ValueTypeNotSupported {
            name: name.to_string(),
            expected: input.kind,
            found: format!("{raw:?}"),
        };

        let result = match input.kind {
            InputKind::String | InputKind::Select => Self::String(raw.to_string()),
            InputKind::Int => Self::Int(raw.trim().parse().map_err(|_| mismatch())?),
            InputKind::Bool => Self::Bool(raw.trim().parse().map_err(|_| mismatch())?),
            InputKind::Map => match serde_json::from_str(raw) {
                Ok(Value::Object(map)) => Self::Map(map),
                _ => return Err(mismatch()),
            },
        };
        result.check_selection(name, input)?;
        Ok(result)
    }

    fn matches(&self, kind: InputKind) -> bool {
        matches!(
            (self, kind),
            (Self::String(_), InputKind::String | InputKind::Select)
                | (Self::Map(_), InputKind::Map)
                | (Self::Int(_), InputKind::Int)
                | (Self::Bool(_), InputKind::Bool)
        )
    }

    fn check_selection(&self, name: &str, input: &InputType) -> Result<()> {
        if let (Self::String(value), InputKind::Select) = (self, input.kind) {
            if !input.options.contains(value) {
                return Err(RenderError::InvalidSelection {
                    name: name.to_string(),
                    value: value.clone(),
                    options: input.options.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Display for RenderValue {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::String(value) => fmt.write_str(value),
            Self::Map(value) => write!(fmt, "{}", Value::Object(value.clone())),
            Self::Int(value) => write!(fmt, "{value}"),
            Self::Bool(value) => write!(fmt, "{value}"),
        }
    }
}

impl Serialize for RenderValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::String(value) => serializer.serialize_str(value),
            Self::Map(value) => value.serialize(serializer),
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::Bool(value) => serializer.serialize_bool(*value),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(number) if number.is_i64() => "int",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Input values by name.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RenderValues(BTreeMap<String, RenderValue>);

impl RenderValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret JSON object of raw values through declared inputs.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::UndeclaredInput`] for values the concept does
    ///   not declare.
    /// - Return [`RenderError::ValueTypeNotSupported`] if `values` is not an
    ///   object, or a value does not have its declared type.
    pub fn from_json(values: &Value, inputs: &ConceptInputs) -> Result<Self> {
        let values = match values {
            Value::Object(values) => values,
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(RenderError::ValueTypeNotSupported {
                    name: "values".into(),
                    expected: InputKind::Map,
                    found: json_type(other).to_string(),
                })
            }
        };

        let mut result = Self::default();
        for (name, value) in values {
            let input = inputs
                .get(name)
                .ok_or_else(|| RenderError::UndeclaredInput(name.clone()))?;
            result.insert(name, RenderValue::from_json(name, value, input)?);
        }
        Ok(result)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: RenderValue) -> Option<RenderValue> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&RenderValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RenderValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Declared inputs that have no value yet, mandatory ones first.
    pub fn missing<'a>(
        &'a self,
        inputs: &'a ConceptInputs,
    ) -> impl Iterator<Item = (&'a String, &'a InputType, bool)> + 'a {
        inputs.all().filter(move |(name, _, _)| !self.contains(name))
    }

    /// Check values against declared inputs.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::UndeclaredInput`] for undeclared values.
    /// - Return [`RenderError::ValueTypeNotSupported`] for values of the
    ///   wrong type.
    /// - Return [`RenderError::InvalidSelection`] for select values that are
    ///   not a declared option.
    /// - Return [`RenderError::MissingMandatoryInput`] if a mandatory input
    ///   has no value.
    pub fn validate(&self, inputs: &ConceptInputs) -> Result<()> {
        for (name, value) in &self.0 {
            let input = inputs
                .get(name)
                .ok_or_else(|| RenderError::UndeclaredInput(name.clone()))?;
            if !value.matches(input.kind) {
                return Err(RenderError::ValueTypeNotSupported {
                    name: name.clone(),
                    expected: input.kind,
                    found: value.type_tag().to_string(),
                });
            }
            value.check_selection(name, input)?;
        }

        if let Some(name) = inputs.mandatory.keys().find(|name| !self.contains(name)) {
            return Err(RenderError::MissingMandatoryInput(name.clone()));
        }

        Ok(())
    }

    /// Values as template source code, by name.
    pub fn ext_code(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(name, value)| (name.clone(), value.to_ext_code()))
            .collect()
    }
}

impl FromIterator<(String, RenderValue)> for RenderValues {
    fn from_iter<I: IntoIterator<Item = (String, RenderValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Friendly result alias :3
type Result<T, E = RenderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use simple_test_case::test_case;

    fn sentry_inputs() -> ConceptInputs {
        ConceptInputs {
            mandatory: BTreeMap::from([("instanceName".into(), InputType::new(InputKind::String))]),
            optional: BTreeMap::from([
                ("replicas".into(), InputType::new(InputKind::Int)),
                ("debug".into(), InputType::new(InputKind::Bool)),
                ("labels".into(), InputType::new(InputKind::Map)),
                ("size".into(), InputType::select(["small", "large"])),
            ]),
        }
    }

    #[test]
    fn values_follow_declared_types() -> anyhow::Result<()> {
        let raw = json!({
            "instanceName": "prod",
            "replicas": 3,
            "debug": true,
            "labels": { "team": "ops" },
            "size": "large",
        });

        let result = RenderValues::from_json(&raw, &sentry_inputs())?;
        assert_eq!(result.get("instanceName"), Some(&RenderValue::String("prod".into())));
        assert_eq!(result.get("replicas"), Some(&RenderValue::Int(3)));
        assert_eq!(result.get("debug"), Some(&RenderValue::Bool(true)));
        assert_eq!(result.get("size"), Some(&RenderValue::String("large".into())));
        assert_eq!(serde_json::to_value(&result)?, raw);

        Ok(())
    }

    #[test_case(json!({ "replicas": 3.5 }); "float for int")]
    #[test_case(json!({ "replicas": "3" }); "string for int")]
    #[test_case(json!({ "debug": "true" }); "string for bool")]
    #[test_case(json!({ "instanceName": 7 }); "int for string")]
    #[test_case(json!({ "labels": ["a"] }); "array for map")]
    #[test]
    fn mismatched_json_type_is_rejected(raw: Value) {
        let result = RenderValues::from_json(&raw, &sentry_inputs());
        assert!(matches!(result, Err(RenderError::ValueTypeNotSupported { .. })));
    }

    #[test]
    fn undeclared_and_invalid_values_are_rejected() {
        let result = RenderValues::from_json(&json!({ "color": "red" }), &sentry_inputs());
        assert!(matches!(result, Err(RenderError::UndeclaredInput(name)) if name == "color"));

        let result = RenderValues::from_json(&json!({ "size": "huge" }), &sentry_inputs());
        assert!(matches!(result, Err(RenderError::InvalidSelection { .. })));
    }

    #[test_case(InputType::new(InputKind::String), "prod", Some(r#""prod""#); "string is quoted")]
    #[test_case(InputType::new(InputKind::String), "say \"hi\"", Some(r#""say \"hi\"""#); "string is escaped")]
    #[test_case(InputType::new(InputKind::Int), "42", Some("42"); "int literal")]
    #[test_case(InputType::new(InputKind::Bool), "false", Some("false"); "bool literal")]
    #[test_case(InputType::new(InputKind::Map), r#"{"b": 1, "a": "x"}"#, Some(r#"{"a":"x","b":1}"#); "map literal")]
    #[test_case(InputType::new(InputKind::Int), "many", None; "bad int")]
    #[test_case(InputType::new(InputKind::Map), "[1]", None; "bad map")]
    #[test]
    fn parsed_values_become_ext_code(input: InputType, raw: &str, expect: Option<&str>) {
        let result = RenderValue::parse("value", raw, &input).map(|value| value.to_ext_code());
        pretty_assertions::assert_eq!(result.ok().as_deref(), expect);
    }

    #[test]
    fn validate_reports_missing_mandatory_input() -> anyhow::Result<()> {
        let inputs = sentry_inputs();
        let mut values = RenderValues::new();
        values.insert("replicas", RenderValue::Int(2));

        let result = values.validate(&inputs);
        assert!(matches!(result, Err(RenderError::MissingMandatoryInput(name)) if name == "instanceName"));

        let missing = values.missing(&inputs).map(|(name, _, _)| name.as_str()).collect::<Vec<_>>();
        assert_eq!(missing, vec!["instanceName", "debug", "labels", "size"]);

        values.insert("instanceName", RenderValue::String("prod".into()));
        values.validate(&inputs)?;

        values.insert("debug", RenderValue::Int(1));
        assert!(matches!(
            values.validate(&inputs),
            Err(RenderError::ValueTypeNotSupported { .. })
        ));

        Ok(())
    }
}
