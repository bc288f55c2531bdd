use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use super::{FunctionDef, Meta, Model, ParamType, RecordMeta, RewriteRule};
use crate::compiler::expr::Expr;
use crate::compiler::parser::parse_expression;
use crate::error::{RecordbaseError, Result};

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    constants: BTreeMap<String, String>,
    #[serde(default)]
    records: serde_yaml::Mapping,
    #[serde(default)]
    cascades: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    rewrites: Vec<RewriteRule>,
}

#[derive(Debug, Deserialize)]
struct RecordFile {
    #[serde(default)]
    table: bool,
    #[serde(default)]
    user_facing_key: Option<String>,
    #[serde(default)]
    fields: serde_yaml::Mapping,
    #[serde(default)]
    functions: serde_yaml::Mapping,
    #[serde(default)]
    segments: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct FunctionFile {
    #[serde(default)]
    params: Vec<String>,
    returns: String,
    body: String,
}

/// Parse a metadata YAML file into a Model
pub fn parse_model(path: &Path) -> Result<Model> {
    let content = std::fs::read_to_string(path)?;
    parse_model_str(&content)
}

/// Parse a metadata YAML string into a Model
pub fn parse_model_str(content: &str) -> Result<Model> {
    let file: ModelFile = serde_yaml::from_str(content)?;

    let mut raw = Vec::new();
    for (key, value) in file.records {
        let name = mapping_key(&key)?;
        let record: RecordFile = serde_yaml::from_value(value)?;
        raw.push((name, record));
    }

    let mut resolver = Resolver {
        raw: raw.iter().map(|(name, record)| (name.clone(), record)).collect(),
        built: BTreeMap::new(),
        visiting: Vec::new(),
    };
    for (name, _) in &raw {
        resolver.record(name)?;
    }

    for (parent, children) in &file.cascades {
        for table in std::iter::once(parent).chain(children) {
            if !resolver.built.get(table).map(|r| r.table).unwrap_or(false) {
                return Err(RecordbaseError::Schema(format!(
                    "cascade references unknown table '{table}'"
                )));
            }
        }
    }

    Ok(Model {
        schema: file.schema,
        records: resolver.built,
        constants: file.constants,
        cascades: file.cascades,
        rewrites: file.rewrites,
    })
}

/// Parse a type string against an already-loaded model.
pub fn parse_type(text: &str, model: &Model) -> Result<Meta> {
    parse_type_with(text, &mut |name| {
        model
            .record(name)
            .map(|record| Meta::Record(record.clone()))
            .ok_or_else(|| RecordbaseError::Schema(format!("unknown type '{name}'")))
    })
}

fn mapping_key(key: &serde_yaml::Value) -> Result<String> {
    key.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| RecordbaseError::Schema(format!("expected a string key, got {key:?}")))
}

fn parse_type_with(text: &str, record: &mut dyn FnMut(&str) -> Result<Meta>) -> Result<Meta> {
    let text = text.trim();
    if let Some(inner) = text.strip_suffix("[]?") {
        return Ok(Meta::OptionalArray(Box::new(parse_type_with(inner, record)?)));
    }
    if let Some(inner) = text.strip_suffix("[]") {
        return Ok(Meta::Array(Box::new(parse_type_with(inner, record)?)));
    }
    if let Some(values) = text.strip_prefix("enum(").and_then(|s| s.strip_suffix(')')) {
        let values: Vec<String> = values.split('|').map(|v| v.trim().to_string()).collect();
        if values.iter().any(|v| v.is_empty()) {
            return Err(RecordbaseError::Schema(format!("empty enum value in '{text}'")));
        }
        return Ok(Meta::Enum(values));
    }
    if let Some(target) = text.strip_prefix("link<").and_then(|s| s.strip_suffix('>')) {
        return Ok(Meta::Uuid {
            link_to: Some(target.trim().to_string()),
        });
    }
    Ok(match text {
        "uuid" => Meta::Uuid { link_to: None },
        "string" => Meta::String,
        "phone" => Meta::Phone,
        "binary" => Meta::Binary,
        "null" => Meta::Null,
        "money" => Meta::Money,
        "money?" => Meta::OptionalMoney,
        "quantity" => Meta::Quantity,
        "quantity?" => Meta::OptionalQuantity,
        "percentage" => Meta::Percentage,
        "percentage?" => Meta::OptionalPercentage,
        "boolean" => Meta::Boolean,
        "boolean?" => Meta::OptionalBoolean,
        "date" => Meta::Date,
        "datetime" => Meta::DateTime,
        "serial" => Meta::Serial,
        "version" => Meta::Version,
        name => record(name)?,
    })
}

fn parse_param(text: &str) -> Result<ParamType> {
    let text = text.trim();
    if text == "uuid" {
        return Ok(ParamType::Key { link_to: None });
    }
    if let Some(target) = text.strip_prefix("link<").and_then(|s| s.strip_suffix('>')) {
        return Ok(ParamType::Key {
            link_to: Some(target.trim().to_string()),
        });
    }
    if let Some(inner) = text.strip_suffix("[]") {
        return Ok(ParamType::RecordArray(inner.trim().to_string()));
    }
    Ok(ParamType::Record(text.to_string()))
}

struct Resolver<'a> {
    raw: HashMap<String, &'a RecordFile>,
    built: BTreeMap<String, Arc<RecordMeta>>,
    visiting: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn record(&mut self, name: &str) -> Result<Arc<RecordMeta>> {
        if let Some(record) = self.built.get(name) {
            return Ok(record.clone());
        }
        if self.visiting.iter().any(|v| v == name) {
            return Err(RecordbaseError::Schema(format!(
                "record '{name}' contains itself: {} -> {name}",
                self.visiting.join(" -> ")
            )));
        }
        let raw = *self
            .raw
            .get(name)
            .ok_or_else(|| RecordbaseError::Schema(format!("unknown type '{name}'")))?;

        self.visiting.push(name.to_string());
        let result = self.build(name, raw);
        self.visiting.pop();

        let record = Arc::new(result?);
        self.built.insert(name.to_string(), record.clone());
        Ok(record)
    }

    fn meta(&mut self, text: &str) -> Result<Meta> {
        parse_type_with(text, &mut |name| self.record(name).map(Meta::Record))
    }

    fn build(&mut self, name: &str, raw: &RecordFile) -> Result<RecordMeta> {
        let mut fields = Vec::new();
        if raw.table {
            if !raw.fields.contains_key("id") {
                fields.push(("id".to_string(), Meta::Uuid { link_to: None }));
            }
            if !raw.fields.contains_key("recordVersion") {
                fields.push(("recordVersion".to_string(), Meta::Version));
            }
        }
        for (key, value) in &raw.fields {
            let key = mapping_key(key)?;
            let text = value.as_str().ok_or_else(|| {
                RecordbaseError::Schema(format!("field '{name}.{key}' must be a type string"))
            })?;
            let meta = self.meta(text)?;
            fields.push((key, meta));
        }

        let mut functions = Vec::new();
        for (key, value) in &raw.functions {
            let key = mapping_key(key)?;
            let file: FunctionFile = serde_yaml::from_value(value.clone())?;
            let body = parse_expression(&file.body)?;
            match &body {
                Expr::Lambda { params, .. } if params.len() == file.params.len() => {}
                Expr::Lambda { params, .. } => {
                    return Err(RecordbaseError::Schema(format!(
                        "function '{name}.{key}' declares {} params but its body takes {}",
                        file.params.len(),
                        params.len()
                    )))
                }
                _ => {
                    return Err(RecordbaseError::Schema(format!(
                        "function '{name}.{key}' body must be a lambda"
                    )))
                }
            }
            functions.push(FunctionDef {
                name: key,
                params: file.params.iter().map(|p| parse_param(p)).collect::<Result<_>>()?,
                returns: self.meta(&file.returns)?,
                body,
            });
        }

        let mut segments = Vec::new();
        for (key, value) in &raw.segments {
            let key = mapping_key(key)?;
            let paths: Vec<String> = serde_yaml::from_value(value.clone())?;
            segments.push((key, paths));
        }

        Ok(RecordMeta {
            name: name.to_string(),
            table: raw.table,
            user_facing_key: raw.user_facing_key.clone(),
            fields,
            functions,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_preserves_field_order() {
        let model = parse_model_str(
            r#"
records:
  Family:
    table: true
    user_facing_key: surname
    fields:
      surname: string
      status: enum(open|closed)
      manager: link<User>
      pets: Pet[]?
  Pet:
    fields:
      name: string
  User:
    table: true
    fields:
      name: string
"#,
        )
        .unwrap();
        let family = model.table("Family").unwrap();
        let keys: Vec<&str> = family.fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["id", "recordVersion", "surname", "status", "manager", "pets"]);
        assert_eq!(family.user_facing_key.as_deref(), Some("surname"));
        assert_eq!(family.field("status"), Some(&Meta::Enum(vec!["open".into(), "closed".into()])));
        assert_eq!(
            family.field("manager"),
            Some(&Meta::Uuid {
                link_to: Some("User".into())
            })
        );
        assert!(matches!(family.field("pets"), Some(Meta::OptionalArray(_))));
        assert!(model.table("Pet").is_none());
        assert_eq!(model.tables().count(), 2);
    }

    #[test]
    fn test_parse_functions_and_segments() {
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
      children: Person[]
    functions:
      happyChildren:
        params: [Family]
        returns: quantity
        body: "(family) => sumMap(family.children, (child) => child.happy ? 1 : 0)"
    segments:
      byChild: [children]
"#,
        )
        .unwrap();
        let family = model.table("Family").unwrap();
        let function = family.function("happyChildren").unwrap();
        assert_eq!(function.params, vec![ParamType::Record("Family".into())]);
        assert_eq!(function.returns, Meta::Quantity);
        assert_eq!(family.segment("byChild"), Some(&vec!["children".to_string()]));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let err = parse_model_str(
            r#"
records:
  Family:
    table: true
    fields:
      pet: Pet
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown type 'Pet'"));
    }

    #[test]
    fn test_self_containing_record_is_an_error() {
        let err = parse_model_str(
            r#"
records:
  Node:
    fields:
      next: Node
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("contains itself"));
    }

    #[test]
    fn test_function_arity_mismatch_is_an_error() {
        let err = parse_model_str(
            r#"
records:
  Family:
    table: true
    fields:
      name: string
    functions:
      label:
        params: [Family, uuid]
        returns: string
        body: "(family) => family.name"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("declares 2 params"));
    }

    #[test]
    fn test_cascade_must_name_tables() {
        let err = parse_model_str(
            r#"
records:
  Family:
    table: true
    fields:
      name: string
cascades:
  Family: [Pet]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RecordbaseError::Schema(_)));
    }

    #[test]
    fn test_parse_type_against_model() {
        let model = parse_model_str(
            r#"
records:
  Person:
    fields:
      name: string
"#,
        )
        .unwrap();
        assert!(matches!(parse_type("Person[]", &model).unwrap(), Meta::Array(_)));
        assert_eq!(parse_type("money?", &model).unwrap(), Meta::OptionalMoney);
        assert!(parse_type("Nope", &model).is_err());
    }
}
