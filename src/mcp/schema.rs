use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

/// Checked parameter kinds a remote tool schema can declare.
///
/// Unrecognized or absent type tags map to `Any`, which accepts every value
/// rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Num,
    Bool,
    Any,
}

impl ParamKind {
    fn from_type_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("string") => ParamKind::Str,
            Some("number") | Some("integer") => ParamKind::Num,
            Some("boolean") => ParamKind::Bool,
            _ => ParamKind::Any,
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::Str => value.is_string(),
            ParamKind::Num => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Any => true,
        }
    }

    fn type_tag(self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Num => "number",
            ParamKind::Bool => "boolean",
            ParamKind::Any => "any",
        }
    }
}

/// Argument validation failure for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaMismatch {
    WrongKind {
        field: String,
        expected: &'static str,
    },
    MissingField {
        field: String,
    },
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaMismatch::WrongKind { field, expected } => {
                write!(f, "argument '{field}' is not a {expected}")
            }
            SchemaMismatch::MissingField { field } => {
                write!(f, "required argument '{field}' is missing")
            }
        }
    }
}

impl std::error::Error for SchemaMismatch {}

/// Locally checkable parameter schema for one remote tool.
///
/// Built once per discovered tool from the server's declared input schema;
/// validation never consults the network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    fields: BTreeMap<String, ParamKind>,
    required: Vec<String>,
}

impl ParamSchema {
    /// Translates a remote tool's declared input schema into a validator.
    ///
    /// The input is the JSON rendering of a JSON-schema-like object: a
    /// `properties` map whose entries carry a primitive `type` tag. A
    /// missing or empty schema yields a validator accepting the empty
    /// argument object.
    pub fn translate(input_schema: &Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(properties) = input_schema.get("properties").and_then(Value::as_object) {
            for (name, declared) in properties {
                let tag = declared.get("type").and_then(Value::as_str);
                fields.insert(name.clone(), ParamKind::from_type_tag(tag));
            }
        }

        let required = input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|name| fields.contains_key(*name))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self { fields, required }
    }

    pub fn kind_of(&self, field: &str) -> Option<ParamKind> {
        self.fields.get(field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks an argument object against the declared schema.
    ///
    /// Declared-typed fields must match their kind when present; fields the
    /// server marked required must be present; everything undeclared passes
    /// through unchecked.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<(), SchemaMismatch> {
        for field in &self.required {
            if !arguments.contains_key(field) {
                return Err(SchemaMismatch::MissingField {
                    field: field.clone(),
                });
            }
        }

        for (field, value) in arguments {
            let Some(kind) = self.fields.get(field) else {
                continue;
            };
            if !kind.matches(value) {
                return Err(SchemaMismatch::WrongKind {
                    field: field.clone(),
                    expected: kind.type_tag(),
                });
            }
        }

        Ok(())
    }

    /// Renders the schema back into the object shape the model API expects
    /// for tool `parameters`.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for (name, kind) in &self.fields {
            let declared = match kind {
                ParamKind::Any => Map::new(),
                checked => {
                    Map::from_iter([("type".to_string(), Value::from(checked.type_tag()))])
                }
            };
            properties.insert(name.clone(), Value::Object(declared));
        }

        let mut schema = Map::from_iter([
            ("type".to_string(), Value::from("object")),
            ("properties".to_string(), Value::Object(properties)),
        ]);
        if !self.required.is_empty() {
            schema.insert(
                "required".to_string(),
                Value::Array(self.required.iter().cloned().map(Value::from).collect()),
            );
        }
        Value::Object(schema)
    }
}
