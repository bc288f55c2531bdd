//! Structured filters and their translation to predicates.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::columns::ColumnTree;
use crate::error::Result;
use crate::meta::{Meta, RewriteRule};
use crate::sql::Sql;

/// A boolean filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Or { or: Vec<Filter> },
    And { and: Vec<Filter> },
    Not { not: Box<Filter> },
    Column { column: String, filter: FilterDetail },
}

/// Conditions on one column. All present conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    /// `Some(Value::Null)` matches null columns.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub equal: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub not_equal: Option<Value>,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greater: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesser: Option<Value>,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub within: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersects: Option<Vec<Value>>,
}

/// Distinguishes an explicit `null` from an absent key.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Filter {
    pub fn column(column: &str, filter: FilterDetail) -> Self {
        Filter::Column {
            column: column.to_string(),
            filter,
        }
    }
}

/// Bound literal for a filter value.
pub(crate) fn literal(value: &Value) -> Sql {
    match value {
        Value::Null => Sql::opt_param(None),
        Value::String(s) => Sql::param(s.clone()),
        Value::Bool(b) => Sql::param(if *b { "true" } else { "false" }),
        other => Sql::param(other.to_string()),
    }
}

/// Translates filter trees for one table, collecting the materialized
/// CTEs produced by rewrite rules.
pub struct FilterTranslator<'a> {
    pub columns: &'a ColumnTree,
    pub table: &'a str,
    pub segment: Option<&'a str>,
    pub rewrites: Vec<&'a RewriteRule>,
    pub withs: Vec<Sql>,
    next_alias: usize,
}

impl<'a> FilterTranslator<'a> {
    pub fn new(columns: &'a ColumnTree, table: &'a str, segment: Option<&'a str>, rewrites: Vec<&'a RewriteRule>) -> Self {
        FilterTranslator {
            columns,
            table,
            segment,
            rewrites,
            withs: Vec::new(),
            next_alias: 0,
        }
    }

    fn alias(&mut self) -> String {
        self.next_alias += 1;
        format!("F{}", self.next_alias)
    }

    /// The conjunction of `filters`, or `None` when there is nothing to test.
    pub fn translate_all(&mut self, filters: &[Filter]) -> Result<Option<Sql>> {
        let mut predicates = Vec::new();
        for filter in filters {
            predicates.extend(self.translate(filter)?);
        }
        Ok(conjunction(predicates))
    }

    fn translate(&mut self, filter: &Filter) -> Result<Vec<Sql>> {
        match filter {
            Filter::Or { or } => {
                if or.is_empty() {
                    return Ok(vec![Sql::raw("false")]);
                }
                let mut branches = Vec::new();
                for item in or {
                    let predicates = self.translate(item)?;
                    branches.push(conjunction(predicates).unwrap_or_else(|| Sql::raw("true")));
                }
                let mut sql = Sql::raw("(");
                sql.append(Sql::join(branches, " OR "));
                sql.push_text(")");
                Ok(vec![sql])
            }
            Filter::And { and } => {
                let mut predicates = Vec::new();
                for item in and {
                    predicates.extend(self.translate(item)?);
                }
                Ok(predicates)
            }
            Filter::Not { not } => {
                let inner = conjunction(self.translate(not)?).unwrap_or_else(|| Sql::raw("true"));
                Ok(vec![Sql::format("not ?", [inner])])
            }
            Filter::Column { column, filter } => self.leaf(column, filter),
        }
    }

    fn leaf(&mut self, column: &str, filter: &FilterDetail) -> Result<Vec<Sql>> {
        let table = self.table;
        let rule = self
            .rewrites
            .iter()
            .copied()
            .find(|rule| column.starts_with(&rule.prefix) && rule.table.as_deref().map_or(true, |t| t == table));
        if let Some(rule) = rule {
            let role = &column[rule.prefix.len()..];
            let personnel = self.columns.resolve_path(self.table, self.segment, &rule.personnel)?;
            let target = Sql::raw(crate::naming::quote_ident(&rule.user_column));
            let inner = conjunction(self.conditions(&target, &Meta::String, filter)).unwrap_or_else(|| Sql::raw("true"));

            let cte = format!("W{}", self.withs.len());
            let mut with = Sql::raw(format!("{cte} AS MATERIALIZED (SELECT id FROM {} WHERE ", rule.user_table));
            with.append(inner);
            with.push_text(")");
            self.withs.push(with);

            return Ok(vec![Sql::format(
                &format!(
                    "exists(select 1 from unnest(?) P where P.\"role\" = ?::uuid and P.\"user\" in (select id from {cte}))"
                ),
                [personnel.sql, Sql::param(role)],
            )]);
        }

        let resolved = self.columns.resolve_path(self.table, self.segment, column)?;
        Ok(self.conditions(&resolved.sql, &resolved.meta, filter))
    }

    fn conditions(&mut self, target: &Sql, meta: &Meta, filter: &FilterDetail) -> Vec<Sql> {
        let mut out = Vec::new();
        let is_array = meta.is_array();

        if let Some(pattern) = &filter.like {
            if is_array {
                let alias = self.alias();
                out.push(Sql::format(
                    &format!("coalesce((select bool_or({alias} ilike ?) from unnest(?) {alias}), false)"),
                    [Sql::param(pattern.clone()), target.clone()],
                ));
            } else {
                out.push(Sql::format("? ilike ?", [target.clone(), Sql::param(pattern.clone())]));
            }
        }

        for (value, negated) in [(&filter.equal, false), (&filter.not_equal, true)] {
            let Some(value) = value else { continue };
            if value.is_null() {
                let test = if negated { "? is not null" } else { "? is null" };
                out.push(Sql::format(test, [target.clone()]));
                continue;
            }
            let op = if negated { "!=" } else { "=" };
            if is_array {
                let alias = self.alias();
                let element = if filter.ignore_case {
                    format!("lower({alias}) {op} lower(?)")
                } else {
                    format!("{alias} {op} ?")
                };
                out.push(Sql::format(
                    &format!("coalesce((select bool_or({element}) from unnest(?) {alias}), false)"),
                    [literal(value), target.clone()],
                ));
            } else if filter.ignore_case {
                out.push(Sql::format(&format!("lower(?) {op} lower(?)"), [target.clone(), literal(value)]));
            } else {
                out.push(Sql::format(&format!("? {op} ?"), [target.clone(), literal(value)]));
            }
        }

        if let Some(value) = &filter.greater {
            out.push(Sql::format("? > ?", [target.clone(), literal(value)]));
        }
        if let Some(value) = &filter.lesser {
            out.push(Sql::format("? < ?", [target.clone(), literal(value)]));
        }

        if let Some(values) = &filter.within {
            if values.is_empty() {
                out.push(Sql::raw("false"));
            } else {
                let mut sql = Sql::format("? in (", [target.clone()]);
                sql.append(Sql::join(values.iter().map(literal), ", "));
                sql.push_text(")");
                out.push(sql);
            }
        }

        if let Some(values) = &filter.intersects {
            if values.is_empty() {
                out.push(Sql::raw("false"));
            } else {
                let uuid_items = matches!(meta.items(), Some(Meta::Uuid { .. }));
                let items = values.iter().map(|v| {
                    if uuid_items {
                        Sql::format("?::uuid", [literal(v)])
                    } else {
                        literal(v)
                    }
                });
                let mut sql = Sql::format("? && ARRAY[", [target.clone()]);
                sql.append(Sql::join(items, ","));
                sql.push_text("]");
                out.push(sql);
            }
        }
        out
    }
}

fn conjunction(predicates: Vec<Sql>) -> Option<Sql> {
    match predicates.len() {
        0 => None,
        1 => predicates.into_iter().next(),
        _ => {
            let mut sql = Sql::raw("(");
            sql.append(Sql::join(predicates, " AND "));
            sql.push_text(")");
            Some(sql)
        }
    }
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
  Family:
    table: true
    fields:
      surname: string
      tags: string[]
      owners: uuid[]
      children: Person[]
      size: quantity
"#;

    fn translate(filters: serde_json::Value) -> Option<String> {
        let model = parse_model_str(MODEL).unwrap();
        let tree = ColumnTree::build(&model).unwrap();
        let filters: Vec<Filter> = serde_json::from_value(filters).unwrap();
        let mut translator = FilterTranslator::new(&tree, "Family", None, Vec::new());
        translator.translate_all(&filters).unwrap().map(|sql| sql.to_inline())
    }

    #[test]
    fn test_deserialize_filter_tree() {
        let filters: Vec<Filter> = serde_json::from_value(json!([
            {"or": [{"column": "surname", "filter": {"equal": null}}]},
            {"not": {"column": "size", "filter": {"greater": 3}}},
            {"and": []}
        ]))
        .unwrap();
        assert_eq!(
            filters[0],
            Filter::Or {
                or: vec![Filter::column(
                    "surname",
                    FilterDetail {
                        equal: Some(Value::Null),
                        ..Default::default()
                    }
                )]
            }
        );
        assert!(matches!(filters[1], Filter::Not { .. }));
        assert_eq!(filters[2], Filter::And { and: vec![] });
    }

    #[test]
    fn test_equal_null_and_value() {
        assert_eq!(
            translate(json!([{"column": "surname", "filter": {"equal": null}}])).as_deref(),
            Some("families.\"surname\" is null")
        );
        assert_eq!(
            translate(json!([{"column": "surname", "filter": {"equal": "Adam", "ignore_case": true}}])).as_deref(),
            Some("lower(families.\"surname\") = lower('Adam')")
        );
        assert_eq!(
            translate(json!([{"column": "surname", "filter": {"not_equal": null}}])).as_deref(),
            Some("families.\"surname\" is not null")
        );
    }

    #[test]
    fn test_empty_lists_are_false() {
        assert_eq!(
            translate(json!([{"column": "surname", "filter": {"in": []}}])).as_deref(),
            Some("false")
        );
        assert_eq!(
            translate(json!([{"column": "tags", "filter": {"intersects": []}}])).as_deref(),
            Some("false")
        );
        assert_eq!(translate(json!([{"or": []}])).as_deref(), Some("false"));
    }

    #[test]
    fn test_in_and_intersects() {
        assert_eq!(
            translate(json!([{"column": "surname", "filter": {"in": ["a", "b"]}}])).as_deref(),
            Some("families.\"surname\" in ('a', 'b')")
        );
        assert_eq!(
            translate(json!([{"column": "owners", "filter": {"intersects": ["x"]}}])).as_deref(),
            Some("families.\"owners\" && ARRAY['x'::uuid]")
        );
        assert_eq!(
            translate(json!([{"column": "tags", "filter": {"intersects": ["x", "y"]}}])).as_deref(),
            Some("families.\"tags\" && ARRAY['x','y']")
        );
    }

    #[test]
    fn test_array_like_and_combinators() {
        assert_eq!(
            translate(json!([{"column": "tags", "filter": {"like": "%a%"}}])).as_deref(),
            Some("coalesce((select bool_or(F1 ilike '%a%') from unnest(families.\"tags\") F1), false)")
        );
        assert_eq!(
            translate(json!([
                {"column": "size", "filter": {"greater": 1, "lesser": 5}},
                {"not": {"or": [
                    {"column": "surname", "filter": {"like": "A%"}},
                    {"column": "surname", "filter": {"like": "B%"}}
                ]}}
            ]))
            .as_deref(),
            Some("(families.\"size\" > '1' AND families.\"size\" < '5' AND not (families.\"surname\" ilike 'A%' OR families.\"surname\" ilike 'B%'))")
        );
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let model = parse_model_str(MODEL).unwrap();
        let tree = ColumnTree::build(&model).unwrap();
        let mut translator = FilterTranslator::new(&tree, "Family", None, Vec::new());
        let filters = vec![Filter::column("shoeSize", FilterDetail::default())];
        let err = translator.translate_all(&filters).unwrap_err();
        assert_eq!(err.status(), "INVALID_COLUMN");
    }
}
