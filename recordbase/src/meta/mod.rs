pub mod parser;

pub use parser::{parse_model, parse_model_str, parse_type};

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compiler::expr::Expr;
use crate::naming;

/// Shape of a single value.
#[derive(Debug, Clone, PartialEq)]
pub enum Meta {
    Record(Arc<RecordMeta>),
    Array(Box<Meta>),
    /// `array?`: an array that may itself be null.
    OptionalArray(Box<Meta>),
    Uuid { link_to: Option<String> },
    String,
    Phone,
    Binary,
    Null,
    Money,
    OptionalMoney,
    Quantity,
    OptionalQuantity,
    Percentage,
    OptionalPercentage,
    Boolean,
    OptionalBoolean,
    Date,
    DateTime,
    Serial,
    Version,
    Enum(Vec<String>),
}

/// A record type: ordered fields, computed functions and segments.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMeta {
    pub name: String,
    /// Top-level records are stored in their own table.
    pub table: bool,
    pub user_facing_key: Option<String>,
    pub fields: Vec<(String, Meta)>,
    pub functions: Vec<FunctionDef>,
    pub segments: Vec<(String, Vec<String>)>,
}

/// A computed field. `body` is a lambda whose parameters bind, in order, to
/// `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<ParamType>,
    pub returns: Meta,
    pub body: Expr,
}

/// What a computed-field parameter binds to when the column is built.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    /// The enclosing record of this name (the record itself or a linked
    /// ancestor in scope).
    Record(String),
    /// Rows of another table linking back to the enclosing record.
    RecordArray(String),
    /// The query-time subkey; makes the column parameterized.
    Key { link_to: Option<String> },
}

/// A rule hoisting role-scoped personnel filters into a materialized CTE.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RewriteRule {
    /// Restricts the rule to one table; applies to every table when absent.
    #[serde(default)]
    pub table: Option<String>,
    /// Filter column prefix, e.g. `personnelByRole.name@`. The text after the
    /// prefix is the role id.
    pub prefix: String,
    /// Path to the array of `{role, user}` entries, resolved against the
    /// queried table.
    pub personnel: String,
    /// Table holding the matched users.
    #[serde(default = "default_user_table")]
    pub user_table: String,
    /// User column the leaf predicates apply to.
    #[serde(default = "default_user_column")]
    pub user_column: String,
}

fn default_user_table() -> String {
    "users".into()
}

fn default_user_column() -> String {
    "name".into()
}

/// The complete metadata model.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub schema: Option<String>,
    pub records: BTreeMap<String, Arc<RecordMeta>>,
    pub constants: BTreeMap<String, String>,
    pub cascades: BTreeMap<String, Vec<String>>,
    pub rewrites: Vec<RewriteRule>,
}

impl Model {
    pub fn record(&self, name: &str) -> Option<&Arc<RecordMeta>> {
        self.records.get(name)
    }

    /// Top-level records, in name order.
    pub fn tables(&self) -> impl Iterator<Item = &Arc<RecordMeta>> {
        self.records.values().filter(|r| r.table)
    }

    pub fn table(&self, name: &str) -> Option<&Arc<RecordMeta>> {
        self.records.get(name).filter(|r| r.table)
    }
}

impl RecordMeta {
    pub fn field(&self, name: &str) -> Option<&Meta> {
        self.fields.iter().find(|(key, _)| key == name).map(|(_, meta)| meta)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn segment(&self, name: &str) -> Option<&Vec<String>> {
        self.segments.iter().find(|(key, _)| key == name).map(|(_, paths)| paths)
    }

    pub fn table_name(&self) -> String {
        naming::table_name(&self.name)
    }

    pub fn type_name(&self) -> String {
        naming::type_name(&self.name)
    }
}

impl Meta {
    /// Short name of this value kind, as written in metadata files.
    pub fn kind(&self) -> &'static str {
        match self {
            Meta::Record(_) => "record",
            Meta::Array(_) => "array",
            Meta::OptionalArray(_) => "array?",
            Meta::Uuid { .. } => "uuid",
            Meta::String => "string",
            Meta::Phone => "phone",
            Meta::Binary => "binary",
            Meta::Null => "null",
            Meta::Money => "money",
            Meta::OptionalMoney => "money?",
            Meta::Quantity => "quantity",
            Meta::OptionalQuantity => "quantity?",
            Meta::Percentage => "percentage",
            Meta::OptionalPercentage => "percentage?",
            Meta::Boolean => "boolean",
            Meta::OptionalBoolean => "boolean?",
            Meta::Date => "date",
            Meta::DateTime => "datetime",
            Meta::Serial => "serial",
            Meta::Version => "version",
            Meta::Enum(_) => "enum",
        }
    }

    pub fn items(&self) -> Option<&Meta> {
        match self {
            Meta::Array(items) | Meta::OptionalArray(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        self.items().is_some()
    }

    pub fn as_record(&self) -> Option<&Arc<RecordMeta>> {
        match self {
            Meta::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_decimal(&self) -> bool {
        matches!(
            self,
            Meta::Money
                | Meta::OptionalMoney
                | Meta::Quantity
                | Meta::OptionalQuantity
                | Meta::Percentage
                | Meta::OptionalPercentage
        )
    }

    pub fn is_money(&self) -> bool {
        matches!(self, Meta::Money | Meta::OptionalMoney)
    }

    /// Kinds decoded and stored as plain text.
    pub fn is_textual(&self) -> bool {
        matches!(self, Meta::String | Meta::Phone | Meta::Enum(_))
    }

    /// SQL column type. Nested records map to composite types qualified by
    /// `schema`.
    pub fn sql_type(&self, schema: &str) -> String {
        match self {
            Meta::Record(record) => format!(
                "{}.{}",
                naming::quote_ident(schema),
                naming::quote_ident(&record.type_name())
            ),
            Meta::Array(items) | Meta::OptionalArray(items) => format!("{}[]", items.sql_type(schema)),
            Meta::Uuid { .. } => "uuid".into(),
            Meta::String | Meta::Phone | Meta::Enum(_) | Meta::Null => "text".into(),
            Meta::Binary => "bytea".into(),
            Meta::Money
            | Meta::OptionalMoney
            | Meta::Quantity
            | Meta::OptionalQuantity
            | Meta::Percentage
            | Meta::OptionalPercentage => "decimal".into(),
            Meta::Boolean | Meta::OptionalBoolean => "boolean".into(),
            Meta::Date => "date".into(),
            Meta::DateTime => "timestamptz".into(),
            Meta::Serial => "serial".into(),
            Meta::Version => "integer".into(),
        }
    }

    /// The zero value for this shape.
    pub fn default_value(&self) -> Value {
        match self {
            Meta::String | Meta::Phone | Meta::Binary => Value::String(String::new()),
            Meta::Record(record) => {
                let mut object = Map::new();
                for (key, meta) in &record.fields {
                    object.insert(key.clone(), meta.default_value());
                }
                Value::Object(object)
            }
            Meta::Array(_) => Value::Array(Vec::new()),
            Meta::Money | Meta::Percentage | Meta::Quantity => Value::String("0".into()),
            Meta::Boolean => Value::Bool(false),
            Meta::Enum(values) => values.first().cloned().map(Value::String).unwrap_or(Value::Null),
            Meta::OptionalArray(_)
            | Meta::OptionalMoney
            | Meta::OptionalPercentage
            | Meta::OptionalQuantity
            | Meta::OptionalBoolean
            | Meta::Uuid { .. }
            | Meta::Date
            | Meta::DateTime
            | Meta::Serial
            | Meta::Version
            | Meta::Null => Value::Null,
        }
    }

    /// Fill in missing or empty parts of `value` with defaults, dropping
    /// undeclared record keys.
    pub fn repair(&self, value: &Value) -> Value {
        match self {
            Meta::Record(record) => {
                let empty = Map::new();
                let object = value.as_object().unwrap_or(&empty);
                let mut repaired = Map::new();
                for (key, meta) in &record.fields {
                    let field = object.get(key).unwrap_or(&Value::Null);
                    repaired.insert(key.clone(), meta.repair(field));
                }
                Value::Object(repaired)
            }
            Meta::Array(items) => match value {
                Value::Array(values) => Value::Array(values.iter().map(|v| items.repair(v)).collect()),
                _ => Value::Array(Vec::new()),
            },
            Meta::OptionalArray(items) => match value {
                Value::Array(values) => Value::Array(values.iter().map(|v| items.repair(v)).collect()),
                _ => Value::Null,
            },
            Meta::Version | Meta::Serial => match value {
                Value::Number(_) => value.clone(),
                _ => Value::Null,
            },
            Meta::OptionalMoney
            | Meta::OptionalPercentage
            | Meta::OptionalQuantity
            | Meta::OptionalBoolean
            | Meta::Uuid { .. }
            | Meta::Date
            | Meta::DateTime
            | Meta::Null => value.clone(),
            _ => {
                if is_truthy(value) {
                    value.clone()
                } else {
                    self.default_value()
                }
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(_) | Value::Object(_) => true,
    }
}
