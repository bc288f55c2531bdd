//! Text codec for composite and array values.
//!
//! Records are written in the live attribute order of their composite type,
//! which can differ from declaration order once attributes have been added
//! to an existing type. [`Layout`] carries that order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::backend::Cell;
use crate::error::{RecordbaseError, Result};
use crate::meta::{Meta, Model};

/// Attribute order per record name, as found in the live schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layout {
    types: HashMap<String, Vec<String>>,
}

impl Layout {
    pub fn new(types: HashMap<String, Vec<String>>) -> Self {
        Layout { types }
    }

    /// Layout matching declaration order, which is what a freshly created
    /// schema has.
    pub fn declared(model: &Model) -> Self {
        let types = model
            .records
            .values()
            .map(|r| (r.name.clone(), r.fields.iter().map(|(k, _)| k.clone()).collect()))
            .collect();
        Layout { types }
    }

    pub fn fields(&self, record: &str) -> Result<&[String]> {
        self.types
            .get(record)
            .map(|v| v.as_slice())
            .ok_or_else(|| RecordbaseError::Codec(format!("no type information for {record}")))
    }

    pub fn set(&mut self, record: &str, fields: Vec<String>) {
        self.types.insert(record.to_string(), fields);
    }

    /// Slot for a live attribute the model does not declare.
    pub fn undeclared_slot(attribute: &str) -> String {
        format!("{UNDECLARED}{attribute}")
    }

    /// Live attribute name when `slot` is undeclared.
    pub fn undeclared(slot: &str) -> Option<&str> {
        slot.strip_prefix(UNDECLARED)
    }
}

const UNDECLARED: char = '#';

// ── Encoding ────────────────────────────────────────────────────────

/// Accumulates composite text, doubling the escape prefix for every level
/// of quoting.
struct Builder {
    value: String,
    escape: String,
}

impl Builder {
    fn new() -> Self {
        Builder {
            value: String::new(),
            escape: String::new(),
        }
    }

    fn raw(&mut self, text: &str) {
        self.value.push_str(text);
    }

    fn add(&mut self, text: &str) {
        for c in text.chars() {
            if c == '\\' || c == '"' {
                self.value.push_str(&self.escape);
            }
            self.value.push(c);
        }
    }

    fn start_quote(&mut self) {
        self.value.push_str(&self.escape);
        self.value.push('"');
        self.escape = format!("{0}{0}\\", self.escape);
    }

    fn stop_quote(&mut self) {
        let keep = self.escape.len() / 2;
        self.escape.truncate(keep);
        self.value.push_str(&self.escape);
        self.value.push('"');
    }

    fn quoted(&mut self, text: &str) {
        self.start_quote();
        self.add(text);
        self.stop_quote();
    }
}

/// Encode a value as a statement parameter. `None` stands for SQL NULL.
pub fn encode(layout: &Layout, meta: &Meta, value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        return match meta {
            Meta::Version => Err(RecordbaseError::Codec("record version must be set".into())),
            _ => Ok(None),
        };
    }
    match meta {
        Meta::Record(record) => {
            let mut builder = Builder::new();
            encode_fields(layout, record, value, &mut builder)?;
            Ok(Some(builder.value))
        }
        Meta::Array(items) | Meta::OptionalArray(items) => {
            let mut builder = Builder::new();
            encode_items(layout, items, value, &mut builder)?;
            Ok(Some(builder.value))
        }
        Meta::Boolean | Meta::OptionalBoolean => Ok(Some(if value.as_bool() == Some(true) { "t" } else { "f" }.into())),
        Meta::Binary => Ok(Some(encode_binary(value)?)),
        Meta::Null => Err(RecordbaseError::Codec("cannot encode a null-typed value".into())),
        _ => Ok(Some(scalar_text(value))),
    }
}

fn encode_fields(layout: &Layout, record: &crate::meta::RecordMeta, value: &Value, builder: &mut Builder) -> Result<()> {
    let fields = layout.fields(&record.name)?;
    builder.raw("(");
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            builder.add(",");
        }
        if Layout::undeclared(field).is_some() {
            continue;
        }
        let meta = record
            .field(field)
            .ok_or_else(|| RecordbaseError::Codec(format!("missing meta for {}.{field}", record.name)))?;
        encode_inner(layout, meta, value.get(field).unwrap_or(&Value::Null), builder, false)?;
    }
    builder.raw(")");
    Ok(())
}

fn encode_items(layout: &Layout, items: &Meta, value: &Value, builder: &mut Builder) -> Result<()> {
    let values = value
        .as_array()
        .ok_or_else(|| RecordbaseError::Codec(format!("expected an array, got {value}")))?;
    builder.raw("{");
    for (index, item) in values.iter().enumerate() {
        if index > 0 {
            builder.raw(",");
        }
        encode_inner(layout, items, item, builder, true)?;
    }
    builder.raw("}");
    Ok(())
}

/// Encode one attribute or array element at the builder's current depth.
/// Nulls are an empty attribute, or `NULL` inside arrays.
fn encode_inner(layout: &Layout, meta: &Meta, value: &Value, builder: &mut Builder, in_array: bool) -> Result<()> {
    if value.is_null() {
        match meta {
            Meta::Version => return Err(RecordbaseError::Codec("record version must be set".into())),
            _ if in_array => builder.raw("NULL"),
            _ => {}
        }
        return Ok(());
    }
    match meta {
        Meta::Record(record) => {
            builder.start_quote();
            encode_fields(layout, record, value, builder)?;
            builder.stop_quote();
        }
        Meta::Array(items) | Meta::OptionalArray(items) => {
            builder.start_quote();
            encode_items(layout, items, value, builder)?;
            builder.stop_quote();
        }
        Meta::Boolean | Meta::OptionalBoolean => builder.raw(if value.as_bool() == Some(true) { "t" } else { "f" }),
        Meta::Version => builder.add(&scalar_text(value)),
        Meta::Binary => {
            let encoded = encode_binary(value)?;
            builder.quoted(&encoded);
        }
        Meta::Null => return Err(RecordbaseError::Codec("cannot encode a null-typed value".into())),
        _ => builder.quoted(&scalar_text(value)),
    }
    Ok(())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_binary(value: &Value) -> Result<String> {
    let text = value
        .as_str()
        .ok_or_else(|| RecordbaseError::Codec("binary values must be base64 strings".into()))?;
    let bytes = BASE64
        .decode(text)
        .map_err(|e| RecordbaseError::Codec(format!("invalid base64: {e}")))?;
    Ok(format!("\\x{}", hex::encode(bytes)))
}

// ── Decoding ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Element {
    /// An empty attribute.
    Empty,
    Bare(String),
    Quoted(String),
}

/// Split the body of a composite `( )` or array `{ }` literal into its
/// elements, unquoting as it goes.
fn parse_seq(source: &str) -> Result<Vec<Element>> {
    let chars: Vec<char> = source.chars().collect();
    if chars.len() < 2 {
        return Err(RecordbaseError::Codec(format!("malformed literal: {source}")));
    }
    if chars.len() == 2 {
        return Ok(Vec::new());
    }

    #[derive(PartialEq)]
    enum Mode {
        Start,
        Quoted,
        Bare,
        AfterQuote,
        Escape,
    }

    let mut mode = Mode::Start;
    let mut items = Vec::new();
    let mut current = String::new();
    for &c in &chars[1..chars.len() - 1] {
        match mode {
            Mode::Start => match c {
                '"' => mode = Mode::Quoted,
                ',' => items.push(Element::Empty),
                _ => {
                    current.push(c);
                    mode = Mode::Bare;
                }
            },
            Mode::Quoted => match c {
                '"' => mode = Mode::AfterQuote,
                '\\' => mode = Mode::Escape,
                _ => current.push(c),
            },
            Mode::Bare => {
                if c == ',' {
                    items.push(Element::Bare(std::mem::take(&mut current)));
                    mode = Mode::Start;
                } else {
                    current.push(c);
                }
            }
            Mode::AfterQuote => match c {
                '"' => {
                    current.push('"');
                    mode = Mode::Quoted;
                }
                ',' => {
                    items.push(Element::Quoted(std::mem::take(&mut current)));
                    mode = Mode::Start;
                }
                _ => return Err(RecordbaseError::Codec(format!("unexpected '{c}' after quote in {source}"))),
            },
            Mode::Escape => {
                current.push(c);
                mode = Mode::Quoted;
            }
        }
    }
    match mode {
        Mode::Start => items.push(Element::Empty),
        Mode::Bare => items.push(Element::Bare(current)),
        Mode::AfterQuote => items.push(Element::Quoted(current)),
        Mode::Quoted | Mode::Escape => {
            return Err(RecordbaseError::Codec(format!("unterminated quote in {source}")))
        }
    }
    Ok(items)
}

/// Decode composite/array text. `None` is SQL NULL.
pub fn decode(layout: &Layout, meta: &Meta, text: Option<&str>) -> Result<Value> {
    let Some(text) = text else {
        return Ok(Value::Null);
    };
    match meta {
        Meta::Record(record) => {
            let fields = layout.fields(&record.name)?;
            let mut elements = parse_seq(text)?;
            if elements.is_empty() && fields.len() == 1 {
                elements.push(Element::Empty);
            }
            if elements.len() != fields.len() {
                return Err(RecordbaseError::Codec(format!(
                    "{} has {} attributes but the value has {}: {text}",
                    record.name,
                    fields.len(),
                    elements.len()
                )));
            }
            let mut object = Map::new();
            for (field, element) in fields.iter().zip(elements) {
                if Layout::undeclared(field).is_some() {
                    continue;
                }
                let field_meta = record
                    .field(field)
                    .ok_or_else(|| RecordbaseError::Codec(format!("missing meta for {}.{field}", record.name)))?;
                let inner = match element {
                    Element::Empty => None,
                    Element::Bare(s) | Element::Quoted(s) => Some(s),
                };
                object.insert(field.clone(), decode(layout, field_meta, inner.as_deref())?);
            }
            Ok(Value::Object(object))
        }
        Meta::Array(items) | Meta::OptionalArray(items) => {
            let mut values = Vec::new();
            for element in parse_seq(text)? {
                let inner = match element {
                    Element::Empty => None,
                    Element::Bare(s) if s.eq_ignore_ascii_case("NULL") => None,
                    Element::Bare(s) | Element::Quoted(s) => Some(s),
                };
                values.push(decode(layout, items, inner.as_deref())?);
            }
            Ok(Value::Array(values))
        }
        Meta::String
        | Meta::Phone
        | Meta::Enum(_)
        | Meta::Null
        | Meta::Uuid { .. }
        | Meta::Money
        | Meta::OptionalMoney
        | Meta::Quantity
        | Meta::OptionalQuantity
        | Meta::Percentage
        | Meta::OptionalPercentage => Ok(Value::String(text.to_string())),
        Meta::DateTime => Ok(Value::String(normalize_datetime(text)?)),
        Meta::Date => Ok(Value::String(text.chars().take(10).collect())),
        Meta::Version | Meta::Serial => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| RecordbaseError::Codec(format!("invalid integer '{text}': {e}"))),
        Meta::Boolean => Ok(Value::Bool(text == "t" || text == "true")),
        Meta::OptionalBoolean => Ok(if text.is_empty() {
            Value::Null
        } else {
            Value::Bool(text == "t" || text == "true")
        }),
        Meta::Binary => {
            let hex_text = text.strip_prefix("\\x").unwrap_or(text);
            let bytes = hex::decode(hex_text).map_err(|e| RecordbaseError::Codec(format!("invalid bytea: {e}")))?;
            Ok(Value::String(BASE64.encode(bytes)))
        }
    }
}

/// Decode a result cell. Typed cells (dates, timestamps, booleans,
/// integers) and text cells converge on the same representation.
pub fn decode_cell(layout: &Layout, meta: &Meta, cell: &Cell) -> Result<Value> {
    match cell {
        Cell::Null => Ok(Value::Null),
        Cell::Text(text) => decode(layout, meta, Some(text)),
        Cell::Bool(b) => Ok(Value::Bool(*b)),
        Cell::Int(i) => Ok(Value::from(*i)),
        Cell::Date(date) => Ok(Value::String(date.format("%Y-%m-%d").to_string())),
        Cell::Timestamp(ts) => Ok(Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))),
    }
}

/// Render a timestamp as `YYYY-MM-DDTHH:MM:SS.mmmZ` in UTC.
pub fn normalize_datetime(text: &str) -> Result<String> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").map(|n| n.and_utc()))
        .map_err(|e| RecordbaseError::Codec(format!("invalid timestamp '{text}': {e}")))?;
    Ok(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Today's date in the `YYYY-MM-DD` form used for date fields.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::parse_model_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MODEL: &str = r#"
records:
  Person:
    fields:
      name: string
      happy: boolean
      nickname: string
  Family:
    table: true
    fields:
      mother: Person
      children: Person[]
      notes: string[]
      score: money?
      born: date
      photo: binary
"#;

    fn fixture() -> (Model, Layout) {
        let model = parse_model_str(MODEL).unwrap();
        let layout = Layout::declared(&model);
        (model, layout)
    }

    fn record(model: &Model, name: &str) -> Meta {
        Meta::Record(model.record(name).unwrap().clone())
    }

    #[test]
    fn test_encode_person() {
        let (model, layout) = fixture();
        let text = encode(
            &layout,
            &record(&model, "Person"),
            &json!({"name": "Eve \"the first\"", "happy": true, "nickname": "a\\b"}),
        )
        .unwrap();
        assert_eq!(text.as_deref(), Some(r#"("Eve \"the first\"",t,"a\\b")"#));
    }

    #[test]
    fn test_encode_nested_doubles_escapes() {
        let (model, layout) = fixture();
        let meta = Meta::Array(Box::new(record(&model, "Person")));
        let text = encode(&layout, &meta, &json!([{"name": "a\"b", "happy": false, "nickname": ""}])).unwrap();
        assert_eq!(text.as_deref(), Some(r#"{"(\"a\\\"b\",f,\"\")"}"#));
    }

    #[test]
    fn test_encode_null_array_items() {
        let (_, layout) = fixture();
        let meta = Meta::Array(Box::new(Meta::String));
        let text = encode(&layout, &meta, &json!(["x", null, "y,z"])).unwrap();
        assert_eq!(text.as_deref(), Some(r#"{"x",NULL,"y,z"}"#));
        let back = decode(&layout, &meta, text.as_deref()).unwrap();
        assert_eq!(back, json!(["x", null, "y,z"]));
    }

    #[test]
    fn test_round_trip_nested_record() {
        let (model, layout) = fixture();
        let family = record(&model, "Family");
        let value = json!({
            "id": "2b4c3f3e-1c55-4b8b-9b8e-0a6c5d7e8f90",
            "recordVersion": 4,
            "mother": {"name": "Eve, \"mother\" of \\all\\", "happy": true, "nickname": ""},
            "children": [
                {"name": "Cain", "happy": false, "nickname": "(c)"},
                {"name": "Abel", "happy": true, "nickname": "{a}"}
            ],
            "notes": ["one", "two \"quoted\""],
            "score": null,
            "born": "2020-01-02",
            "photo": "aGVsbG8="
        });
        let text = encode(&layout, &family, &value).unwrap();
        let back = decode(&layout, &family, text.as_deref()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_round_trip_deeply_nested() {
        let model = parse_model_str(
            r#"
records:
  Leaf:
    fields:
      label: string
  Branch:
    fields:
      leaves: Leaf[]
      tag: string
  Tree:
    fields:
      branches: Branch[]
      root: Branch
"#,
        )
        .unwrap();
        let layout = Layout::declared(&model);
        let tree = Meta::Record(model.record("Tree").unwrap().clone());
        let value = json!({
            "branches": [
                {"leaves": [{"label": "a\"b\\c"}, {"label": ""}], "tag": "x,y"},
                {"leaves": [], "tag": "()"}
            ],
            "root": {"leaves": [{"label": "\"\""}], "tag": "{}"}
        });
        let text = encode(&layout, &tree, &value).unwrap();
        assert_eq!(decode(&layout, &tree, text.as_deref()).unwrap(), value);
    }

    #[test]
    fn test_decode_postgres_output() {
        let (model, layout) = fixture();
        let person = record(&model, "Person");
        let value = decode(&layout, &person, Some(r#"("Eve ""the first""",t,)"#)).unwrap();
        assert_eq!(value, json!({"name": "Eve \"the first\"", "happy": true, "nickname": null}));

        let value = decode(&layout, &person, Some("(Eve,f,\"\")")).unwrap();
        assert_eq!(value, json!({"name": "Eve", "happy": false, "nickname": ""}));
    }

    #[test]
    fn test_decode_empty_and_null() {
        let (model, layout) = fixture();
        let array = Meta::Array(Box::new(record(&model, "Person")));
        assert_eq!(decode(&layout, &array, Some("{}")).unwrap(), json!([]));
        assert_eq!(decode(&layout, &array, None).unwrap(), Value::Null);
        assert_eq!(decode(&layout, &Meta::Boolean, None).unwrap(), Value::Null);
        assert_eq!(decode(&layout, &Meta::OptionalBoolean, Some("")).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_attribute_count_mismatch_is_an_error() {
        let (model, layout) = fixture();
        let person = record(&model, "Person");
        let err = decode(&layout, &person, Some("(a,t)")).unwrap_err();
        assert!(matches!(err, RecordbaseError::Codec(_)));
    }

    #[test]
    fn test_live_attribute_order_is_respected() {
        let (model, mut layout) = fixture();
        layout.set("Person", vec!["happy".into(), "name".into(), "nickname".into()]);
        let person = record(&model, "Person");
        let text = encode(&layout, &person, &json!({"name": "Eve", "happy": true, "nickname": "e"})).unwrap();
        assert_eq!(text.as_deref(), Some(r#"(t,"Eve","e")"#));
    }

    #[test]
    fn test_undeclared_attribute_is_skipped() {
        let (model, mut layout) = fixture();
        layout.set(
            "Person",
            vec!["name".into(), Layout::undeclared_slot("age"), "happy".into(), "nickname".into()],
        );
        let person = record(&model, "Person");
        let value = decode(&layout, &person, Some("(Eve,42,t,)")).unwrap();
        assert_eq!(value, json!({"name": "Eve", "happy": true, "nickname": null}));

        let text = encode(&layout, &person, &value).unwrap();
        assert_eq!(text.as_deref(), Some(r#"("Eve",,t,)"#));
    }

    #[test]
    fn test_dates_agree_across_paths() {
        let (_, layout) = fixture();
        let from_text = decode(&layout, &Meta::DateTime, Some("2024-03-01 10:20:30.5+00")).unwrap();
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.500Z").unwrap().with_timezone(&Utc);
        let from_cell = decode_cell(&layout, &Meta::DateTime, &Cell::Timestamp(ts)).unwrap();
        assert_eq!(from_text, json!("2024-03-01T10:20:30.500Z"));
        assert_eq!(from_text, from_cell);

        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(decode_cell(&layout, &Meta::Date, &Cell::Date(date)).unwrap(), json!("2024-03-01"));
        assert_eq!(decode(&layout, &Meta::Date, Some("2024-03-01")).unwrap(), json!("2024-03-01"));
    }

    #[test]
    fn test_binary_round_trip() {
        let (_, layout) = fixture();
        let text = encode(&layout, &Meta::Binary, &json!("aGVsbG8=")).unwrap();
        assert_eq!(text.as_deref(), Some("\\x68656c6c6f"));
        assert_eq!(decode(&layout, &Meta::Binary, text.as_deref()).unwrap(), json!("aGVsbG8="));
    }
}
