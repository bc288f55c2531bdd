use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{RecordbaseError, Result};
use crate::meta::{Meta, Model, RecordMeta};

/// Result of validating a record
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Shape checker for stored records, built once per metadata model.
///
/// Type mismatches and undeclared keys are errors. Decimals given as JSON
/// numbers rather than strings are accepted with a warning.
#[derive(Debug, Clone)]
pub struct Validator {
    model: Arc<Model>,
    uuid: Regex,
    date: Regex,
    datetime: Regex,
    decimal: Regex,
    phone: Regex,
}

impl Validator {
    pub fn new(model: Arc<Model>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RecordbaseError::Schema(format!("invalid pattern {pattern}: {e}")))
        };
        Ok(Validator {
            model,
            uuid: compile(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")?,
            date: compile(r"^\d{4}-\d{2}-\d{2}$")?,
            datetime: compile(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z$")?,
            decimal: compile(r"^-?\d+(\.\d+)?$")?,
            phone: compile(r"^\d*$")?,
        })
    }

    /// Validate a record of the given table.
    pub fn validate(&self, table: &str, record: &Value) -> Result<ValidationResult> {
        let meta = self
            .model
            .table(table)
            .ok_or_else(|| RecordbaseError::Schema(format!("unknown table '{table}'")))?;
        let mut result = ValidationResult::default();
        self.check_record(meta, record, table, &mut result);
        if record.get("id").map(Value::is_null).unwrap_or(true) {
            result.errors.push(format!("{table}.id is required"));
        }
        Ok(result)
    }

    /// Validate and turn errors into `INVALID_RECORD`. Returns the warnings.
    pub fn require_valid(&self, table: &str, record: &Value) -> Result<Vec<String>> {
        let result = self.validate(table, record)?;
        if !result.is_ok() {
            return Err(RecordbaseError::InvalidRecord {
                table: table.to_string(),
                errors: result.errors,
            });
        }
        for warning in &result.warnings {
            log::debug!("{table}: {warning}");
        }
        Ok(result.warnings)
    }

    fn check_record(&self, record: &RecordMeta, value: &Value, path: &str, result: &mut ValidationResult) {
        let Some(object) = value.as_object() else {
            result
                .errors
                .push(format!("{path} expected {} object, got {}", record.name, type_name(value)));
            return;
        };
        for (key, meta) in &record.fields {
            let field_path = format!("{path}.{key}");
            match object.get(key) {
                Some(field) => self.check(meta, field, &field_path, result),
                None => result.errors.push(format!("{field_path} is missing")),
            }
        }
        for key in object.keys() {
            if record.field(key).is_none() {
                result.errors.push(format!("{path}.{key} is not a field of {}", record.name));
            }
        }
    }

    fn check(&self, meta: &Meta, value: &Value, path: &str, result: &mut ValidationResult) {
        let nullable = matches!(
            meta,
            Meta::OptionalArray(_)
                | Meta::Uuid { .. }
                | Meta::Null
                | Meta::OptionalMoney
                | Meta::OptionalQuantity
                | Meta::OptionalPercentage
                | Meta::OptionalBoolean
                | Meta::Date
                | Meta::DateTime
                | Meta::Serial
                | Meta::Version
        );
        if value.is_null() {
            if !nullable {
                result.errors.push(format!("{path} must not be null"));
            }
            return;
        }

        let ok = match meta {
            Meta::Record(record) => {
                self.check_record(record, value, path, result);
                true
            }
            Meta::Array(items) | Meta::OptionalArray(items) => match value.as_array() {
                Some(values) => {
                    for (index, item) in values.iter().enumerate() {
                        self.check(items, item, &format!("{path}[{index}]"), result);
                    }
                    true
                }
                None => false,
            },
            Meta::Uuid { .. } => value.as_str().map(|s| self.uuid.is_match(s)).unwrap_or(false),
            Meta::String | Meta::Binary => value.is_string(),
            Meta::Phone => value.as_str().map(|s| self.phone.is_match(s)).unwrap_or(false),
            Meta::Null => false,
            Meta::Money
            | Meta::OptionalMoney
            | Meta::Quantity
            | Meta::OptionalQuantity
            | Meta::Percentage
            | Meta::OptionalPercentage => match value {
                Value::String(s) => self.decimal.is_match(s),
                Value::Number(_) => {
                    result.warnings.push(format!("{path} is a number, expected a decimal string"));
                    true
                }
                _ => false,
            },
            Meta::Boolean | Meta::OptionalBoolean => value.is_boolean(),
            Meta::Date => value.as_str().map(|s| self.date.is_match(s)).unwrap_or(false),
            Meta::DateTime => value.as_str().map(|s| self.datetime.is_match(s)).unwrap_or(false),
            Meta::Serial | Meta::Version => value.is_i64() || value.is_u64(),
            Meta::Enum(values) => {
                if let Some(s) = value.as_str() {
                    if !values.iter().any(|v| v == s) {
                        result
                            .errors
                            .push(format!("{path} value '{s}' is not one of {}", values.join(", ")));
                    }
                    true
                } else {
                    false
                }
            }
        };
        if !ok {
            result
                .errors
                .push(format!("{path} expected {}, got {}", meta.kind(), describe(value)));
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => type_name(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::parse_model_str;
    use serde_json::json;

    fn validator() -> Validator {
        let model = parse_model_str(
            r#"
records:
  Person:
    fields:
      name: string
      happy: boolean
  Family:
    table: true
    fields:
      mother: Person
      children: Person[]
      budget: money
      status: enum(open|closed)
      born: date
      updated: datetime
"#,
        )
        .unwrap();
        Validator::new(Arc::new(model)).unwrap()
    }

    fn family() -> Value {
        json!({
            "id": "8f14e45f-ceea-4e7a-9b1c-1a2b3c4d5e6f",
            "recordVersion": null,
            "mother": {"name": "Eve", "happy": true},
            "children": [{"name": "Cain", "happy": false}],
            "budget": "12.50",
            "status": "open",
            "born": "2020-01-02",
            "updated": "2024-03-01T10:20:30.500Z"
        })
    }

    #[test]
    fn test_valid_family() {
        let result = validator().validate("Family", &family()).unwrap();
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_nested_type_mismatch() {
        let mut record = family();
        record["children"][0]["name"] = json!(42);
        let result = validator().validate("Family", &record).unwrap();
        assert!(!result.is_ok());
        assert!(result.errors.iter().any(|e| e.contains("Family.children[0].name")));
    }

    #[test]
    fn test_invalid_enum_value() {
        let mut record = family();
        record["status"] = json!("archived");
        let result = validator().validate("Family", &record).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("archived")));
    }

    #[test]
    fn test_missing_field_and_bad_formats() {
        let mut record = family();
        record.as_object_mut().unwrap().remove("mother");
        record["budget"] = json!("twelve");
        record["born"] = json!("02/01/2020");
        let result = validator().validate("Family", &record).unwrap();
        assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
    }

    #[test]
    fn test_unknown_keys_are_errors() {
        let mut record = family();
        record["mother"]["extra"] = json!(true);
        let result = validator().validate("Family", &record).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("Family.mother.extra")));
    }

    #[test]
    fn test_numeric_decimal_is_a_warning() {
        let mut record = family();
        record["budget"] = json!(12.5);
        let result = validator().validate("Family", &record).unwrap();
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
        assert!(result.has_warnings());
    }

    #[test]
    fn test_require_valid_reports_invalid_record() {
        let mut record = family();
        record["id"] = Value::Null;
        let err = validator().require_valid("Family", &record).unwrap_err();
        assert_eq!(err.status(), "INVALID_RECORD");
    }
}
