//! Computed-field compiler.
//!
//! Turns an expression tree over typed symbols into a SQL fragment plus the
//! shape of its result. Everything is resolved when the column tree is built;
//! nothing here runs per query.

pub mod expr;
pub mod parser;

use heck::ToLowerCamelCase;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::error::{RecordbaseError, Result};
use crate::meta::{FunctionDef, Meta, Model};
use crate::naming;
use crate::sql::{field_access, Sql};
use expr::{BinaryOp, Expr, TemplatePart, UnaryOp};

/// A compiled expression: its SQL and the shape of what it yields.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub meta: Meta,
    pub sql: Sql,
}

impl Value {
    pub fn new(meta: Meta, sql: Sql) -> Self {
        Value { meta, sql }
    }
}

/// Lookup used by `resolve("a.b")`: existing columns of the record being
/// compiled.
pub trait Resolve {
    fn resolve(&self, path: &str) -> Option<Value>;
}

/// Resolver for contexts with no sibling columns.
pub struct NoColumns;

impl Resolve for NoColumns {
    fn resolve(&self, _path: &str) -> Option<Value> {
        None
    }
}

pub type Symbols = HashMap<String, Value>;

pub struct Compiler<'m> {
    model: &'m Model,
    next_alias: Cell<usize>,
    inlining: RefCell<Vec<String>>,
}

impl<'m> Compiler<'m> {
    pub fn new(model: &'m Model) -> Self {
        Compiler {
            model,
            next_alias: Cell::new(0),
            inlining: RefCell::new(Vec::new()),
        }
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    /// A correlation alias unique within this compiler.
    pub fn fresh_alias(&self) -> String {
        let n = self.next_alias.get() + 1;
        self.next_alias.set(n);
        format!("T{n}")
    }

    /// Compile a function body with its parameters bound to `args`. The
    /// result meta is inferred from the body.
    pub fn apply(&self, body: &Expr, args: Vec<Value>, columns: &dyn Resolve) -> Result<Value> {
        let (params, inner) = match body {
            Expr::Lambda { params, body } => (params, body),
            other => return Err(compile_error(format!("expected a lambda, got {other:?}"))),
        };
        if params.len() != args.len() {
            return Err(compile_error(format!(
                "argument length mismatch: expected {}, got {}",
                params.len(),
                args.len()
            )));
        }
        let symbols: Symbols = params.iter().cloned().zip(args).collect();
        self.compile(inner, &symbols, columns)
    }

    /// Compile a computed field, reporting failures with the field's name.
    pub fn function(&self, record: &str, def: &FunctionDef, args: Vec<Value>, columns: &dyn Resolve) -> Result<Value> {
        let compiled = self
            .apply(&def.body, args, columns)
            .map_err(|e| compile_error(format!("{record}.{}: {}", def.name, strip(e))))?;
        Ok(Value::new(def.returns.clone(), compiled.sql))
    }

    pub fn compile(&self, expr: &Expr, symbols: &Symbols, columns: &dyn Resolve) -> Result<Value> {
        match expr {
            Expr::Ident(name) => symbols
                .get(name)
                .cloned()
                .ok_or_else(|| compile_error(format!("unbound identifier '{name}'"))),
            Expr::Str(text) => Ok(Value::new(Meta::String, Sql::param(text.clone()))),
            Expr::Number(n) => Ok(Value::new(Meta::Quantity, Sql::raw(n.clone()))),
            Expr::Bool(b) => Ok(Value::new(Meta::Boolean, Sql::raw(if *b { "true" } else { "false" }))),
            Expr::Null => Ok(Value::new(Meta::Null, Sql::null())),
            Expr::New { class, args } => {
                let literal = match args.as_slice() {
                    [Expr::Str(v)] | [Expr::Number(v)] => v.clone(),
                    _ => return Err(compile_error(format!("new {class} expects one literal argument"))),
                };
                Ok(Value::new(Meta::Quantity, Sql::format("?::decimal", [Sql::param(literal)])))
            }
            Expr::Unary(op, inner) => {
                let inner = self.compile(inner, symbols, columns)?;
                Ok(match op {
                    UnaryOp::Not => Value::new(Meta::Boolean, Sql::format("(NOT ?)", [inner.sql])),
                    UnaryOp::Neg => Value::new(inner.meta, Sql::format("(-?)", [inner.sql])),
                })
            }
            Expr::Binary(op, left, right) => self.binary(*op, left, right, symbols, columns),
            Expr::Conditional(test, then, otherwise) => {
                let test = self.compile(test, symbols, columns)?;
                let then = self.compile(then, symbols, columns)?;
                let otherwise = self.compile(otherwise, symbols, columns)?;
                let meta = if then.meta == Meta::Null { otherwise.meta } else { then.meta };
                Ok(Value::new(
                    meta,
                    Sql::format("(case when ? then ? else ? end)", [test.sql, then.sql, otherwise.sql]),
                ))
            }
            Expr::Array(items) => {
                if items.is_empty() {
                    return Ok(Value::new(Meta::Array(Box::new(Meta::Null)), Sql::raw("'{}'")));
                }
                let items = items
                    .iter()
                    .map(|item| self.compile(item, symbols, columns))
                    .collect::<Result<Vec<_>>>()?;
                let meta = Meta::Array(Box::new(items[0].meta.clone()));
                let mut sql = Sql::raw("ARRAY[");
                sql.append(Sql::join(items.into_iter().map(|v| v.sql), ","));
                sql.push_text("]");
                Ok(Value::new(meta, sql))
            }
            Expr::Template(parts) => {
                let mut pieces = Vec::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => pieces.push(Sql::param(text.clone())),
                        TemplatePart::Expr(e) => pieces.push(self.compile(e, symbols, columns)?.sql),
                    }
                }
                let mut sql = Sql::raw("(");
                sql.append(Sql::join(pieces, " || "));
                sql.push_text(")");
                Ok(Value::new(Meta::String, sql))
            }
            Expr::Member(object, property) => self.member(object, property, symbols, columns),
            Expr::Call { target, name, args } => self.call(target.as_deref(), name, args, symbols, columns),
            Expr::Lambda { .. } => Err(compile_error("a lambda is only valid as a combinator argument")),
        }
    }

    fn member(&self, object: &Expr, property: &str, symbols: &Symbols, columns: &dyn Resolve) -> Result<Value> {
        if property == "uuid" {
            return self.compile(object, symbols, columns);
        }
        if let Expr::Ident(namespace) = object {
            if !symbols.contains_key(namespace) {
                if let Some(value) = self.model.constants.get(property) {
                    return Ok(Value::new(Meta::Uuid { link_to: None }, Sql::param(value.clone())));
                }
            }
        }
        let inner = self.compile(object, symbols, columns)?;
        match &inner.meta {
            Meta::Record(record) => {
                let meta = record
                    .field(property)
                    .ok_or_else(|| compile_error(format!("field {property} not found on {}", record.name)))?;
                Ok(Value::new(meta.clone(), field_access(&inner.sql, &naming::column_name(property))))
            }
            Meta::Uuid { link_to: Some(target) } => {
                let record = self
                    .model
                    .table(target)
                    .ok_or_else(|| compile_error(format!("link target {target} is not a table")))?;
                let meta = record
                    .field(property)
                    .ok_or_else(|| compile_error(format!("field {property} not found on {target}")))?;
                let alias = self.fresh_alias();
                let projected = field_access(&Sql::raw(alias.clone()), &naming::column_name(property));
                let sql = Sql::format(
                    &format!("(select ? from {} {alias} where {alias}.id = ?)", record.table_name()),
                    [projected, inner.sql],
                );
                Ok(Value::new(meta.clone(), sql))
            }
            other => Err(compile_error(format!(
                "cannot access .{property} on a {} value",
                other.kind()
            ))),
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr, symbols: &Symbols, columns: &dyn Resolve) -> Result<Value> {
        let l = self.compile(left, symbols, columns)?;
        let r = self.compile(right, symbols, columns)?;
        let sql = match op {
            BinaryOp::And | BinaryOp::Or => {
                return Ok(Value::new(
                    Meta::Boolean,
                    Sql::format(&format!("(? {} ?)", op.sql()), [l.sql, r.sql]),
                ))
            }
            BinaryOp::Eq | BinaryOp::Ne if r.meta == Meta::Null || l.meta == Meta::Null => {
                let operand = if r.meta == Meta::Null { l.sql } else { r.sql };
                let test = if op == BinaryOp::Eq { "(? IS NULL)" } else { "(? IS NOT NULL)" };
                return Ok(Value::new(Meta::Boolean, Sql::format(test, [operand])));
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
                return Ok(Value::new(
                    Meta::Boolean,
                    Sql::format(&format!("(? {} ?)", op.sql()), [l.sql, r.sql]),
                ))
            }
            BinaryOp::Coalesce => {
                let meta = if l.meta == Meta::Null { r.meta } else { l.meta };
                return Ok(Value::new(meta, Sql::format("COALESCE(?, ?)", [l.sql, r.sql])));
            }
            BinaryOp::Add if l.meta.is_textual() || r.meta.is_textual() => {
                return Ok(Value::new(Meta::String, Sql::format("(? || ?)", [l.sql, r.sql])))
            }
            BinaryOp::Div => return Ok(divide(l, r)),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => op.sql(),
        };
        Ok(arithmetic(sql, l, r))
    }

    fn call(
        &self,
        target: Option<&Expr>,
        name: &str,
        args: &[Expr],
        symbols: &Symbols,
        columns: &dyn Resolve,
    ) -> Result<Value> {
        if name.starts_with("calc") {
            return self.inline(name, args, symbols, columns);
        }
        let arg = |i: usize| -> Result<Value> {
            let expr = args
                .get(i)
                .ok_or_else(|| compile_error(format!("{name}: missing argument {}", i + 1)))?;
            self.compile(expr, symbols, columns)
        };
        let lambda_arg = |i: usize| -> Result<&Expr> {
            args.get(i)
                .ok_or_else(|| compile_error(format!("{name}: missing argument {}", i + 1)))
        };
        let receiver = || -> Result<Value> {
            let target = target.ok_or_else(|| compile_error(format!("{name} must be called as a method")))?;
            self.compile(target, symbols, columns)
        };

        match name {
            // ── Array combinators ──
            "sumMap" => {
                let base = self.array(name, arg(0)?)?;
                let alias = self.fresh_alias();
                let body = self.lambda(lambda_arg(1)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    body.meta,
                    Sql::format(
                        &format!("coalesce((select sum(?) from unnest(?) as {alias}), 0)"),
                        [body.sql, base.sql],
                    ),
                ))
            }
            "firstMatch" => {
                let base = self.array(name, arg(0)?)?;
                let alias = self.fresh_alias();
                let cond = self.lambda(lambda_arg(1)?, &base, &alias, symbols, columns)?;
                let body = self.lambda(lambda_arg(2)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    body.meta,
                    Sql::format(
                        &format!("(select ? from unnest(?) as {alias} where ? limit 1)"),
                        [body.sql, base.sql, cond.sql],
                    ),
                ))
            }
            "anyMap" => {
                let base = self.array(name, arg(0)?)?;
                let alias = self.fresh_alias();
                let body = self.lambda(lambda_arg(1)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    Meta::Boolean,
                    Sql::format(
                        &format!("coalesce((select bool_or(?) from unnest(?) as {alias}), false)"),
                        [body.sql, base.sql],
                    ),
                ))
            }
            "uniqueMap" => {
                let base = self.array(name, arg(0)?)?;
                let alias = self.fresh_alias();
                let body = self.lambda(lambda_arg(1)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    Meta::Array(Box::new(body.meta)),
                    Sql::format(
                        &format!("(select coalesce(array_agg(distinct ?),'{{}}') from unnest(?) as {alias})"),
                        [body.sql, base.sql],
                    ),
                ))
            }
            "joinMap" => {
                let base = self.array(name, arg(0)?)?;
                let separator = arg(1)?;
                let alias = self.fresh_alias();
                let body = self.lambda(lambda_arg(2)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    Meta::String,
                    Sql::format(
                        &format!("coalesce((select string_agg(?, ?) from unnest(?) as {alias}), '')"),
                        [body.sql, separator.sql, base.sql],
                    ),
                ))
            }
            "lastItem" => {
                let base = self.array(name, arg(0)?)?;
                let item = Sql::format("(?)[array_upper(?, 1)]", [base.sql.clone(), base.sql.clone()]);
                let body = self.lambda_with(lambda_arg(1)?, &base, item, symbols, columns)?;
                Ok(Value::new(
                    body.meta,
                    Sql::format(
                        "(case when array_length(?, 1) is null then null else ? end)",
                        [base.sql, body.sql],
                    ),
                ))
            }
            "maximum" => {
                let base = self.array(name, arg(0)?)?;
                let alias = self.fresh_alias();
                let body = self.lambda(lambda_arg(1)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    body.meta,
                    Sql::format(&format!("(select max(?) from unnest(?) as {alias})"), [body.sql, base.sql]),
                ))
            }
            "filterMap" => {
                let base = self.array(name, arg(0)?)?;
                let alias = self.fresh_alias();
                let cond = self.lambda(lambda_arg(1)?, &base, &alias, symbols, columns)?;
                let body = self.lambda(lambda_arg(2)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    Meta::Array(Box::new(body.meta)),
                    Sql::format(
                        &format!("(select coalesce(array_agg(?),'{{}}') from unnest(?) as {alias} where ?)"),
                        [body.sql, base.sql, cond.sql],
                    ),
                ))
            }
            "map" => {
                let base = self.array(name, receiver()?)?;
                let alias = self.fresh_alias();
                let body = self.lambda(lambda_arg(0)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    Meta::Array(Box::new(body.meta)),
                    Sql::format(
                        &format!("(select coalesce(array_agg(?),'{{}}') from unnest(?) as {alias})"),
                        [body.sql, base.sql],
                    ),
                ))
            }
            "filter" => {
                let base = self.array(name, receiver()?)?;
                let alias = self.fresh_alias();
                let cond = self.lambda(lambda_arg(0)?, &base, &alias, symbols, columns)?;
                Ok(Value::new(
                    base.meta.clone(),
                    Sql::format(
                        &format!("array(select {alias} from unnest(?) as {alias} where ?)"),
                        [base.sql, cond.sql],
                    ),
                ))
            }
            "flatMap" => {
                let base = self.array(name, receiver()?)?;
                let outer = self.fresh_alias();
                let body = self.lambda(lambda_arg(0)?, &base, &outer, symbols, columns)?;
                let items = body
                    .meta
                    .items()
                    .cloned()
                    .ok_or_else(|| compile_error("flatMap callback must return an array"))?;
                let inner = self.fresh_alias();
                Ok(Value::new(
                    Meta::Array(Box::new(items)),
                    Sql::format(
                        &format!(
                            "(select coalesce(array_agg({inner}),'{{}}') from unnest(?) as {outer} cross join lateral unnest(?) as {inner})"
                        ),
                        [base.sql, body.sql],
                    ),
                ))
            }
            "setDifference" => {
                let left = self.array(name, arg(0)?)?;
                let right = self.array(name, arg(1)?)?;
                let alias = self.fresh_alias();
                Ok(Value::new(
                    left.meta.clone(),
                    Sql::format(
                        &format!("array(select {alias} from unnest(?) as {alias} where {alias} <> all(coalesce(?, '{{}}')))"),
                        [left.sql, right.sql],
                    ),
                ))
            }
            "selectArray" => {
                let mut meta = None;
                let mut pieces = Vec::new();
                for i in 0..args.len() {
                    let value = self.array(name, arg(i)?)?;
                    let alias = self.fresh_alias();
                    meta.get_or_insert(value.meta.clone());
                    pieces.push(Sql::format(
                        &format!("(select array_agg({alias}) from unnest(?) as {alias})"),
                        [value.sql],
                    ));
                }
                let meta = meta.ok_or_else(|| compile_error("selectArray needs at least one array"))?;
                let mut sql = Sql::raw("coalesce(");
                sql.append(Sql::join(pieces, ", "));
                sql.push_text(")");
                Ok(Value::new(meta, sql))
            }
            "isEmpty" => {
                let base = self.array(name, arg(0)?)?;
                Ok(Value::new(Meta::Boolean, Sql::format("(array_length(?, 1) IS NULL)", [base.sql])))
            }

            // ── Null handling ──
            "isNull" => Ok(Value::new(Meta::Boolean, Sql::format("(? IS NULL)", [arg(0)?.sql]))),
            "isNotNull" => Ok(Value::new(Meta::Boolean, Sql::format("(? IS NOT NULL)", [arg(0)?.sql]))),
            "ifNull" => {
                let value = arg(0)?;
                let fallback = arg(1)?;
                Ok(Value::new(value.meta, Sql::format("COALESCE(?, ?)", [value.sql, fallback.sql])))
            }

            // ── Numeric helpers ──
            "plus" => Ok(arithmetic("+", receiver()?, arg(0)?)),
            "minus" => Ok(arithmetic("-", receiver()?, arg(0)?)),
            "times" => Ok(arithmetic("*", receiver()?, arg(0)?)),
            "dividedBy" => Ok(divide(receiver()?, arg(0)?)),
            "lessThan" | "lt" => Ok(compare("<", receiver()?, arg(0)?)),
            "greaterThan" | "gt" => Ok(compare(">", receiver()?, arg(0)?)),
            "greaterThanOrEqualTo" => Ok(compare(">=", receiver()?, arg(0)?)),
            "isZero" => Ok(Value::new(Meta::Boolean, Sql::format("(? = 0)", [receiver()?.sql]))),
            "toDecimalPlaces" => {
                let value = receiver()?;
                let places = arg(0)?;
                Ok(Value::new(value.meta, Sql::format("ROUND(?, ?)", [value.sql, places.sql])))
            }

            // ── Dates ──
            "ageDays" => Ok(days_since(receiver()?)),
            "daysAgo" => Ok(days_since(arg(0)?)),
            "extractYear" => Ok(Value::new(Meta::Quantity, Sql::format("extract(year from ?)", [arg(0)?.sql]))),
            "currentYear" => Ok(Value::new(Meta::Quantity, Sql::raw("extract(year from current_date)"))),

            // ── Strings ──
            "format" => Ok(Value::new(
                Meta::String,
                Sql::format(
                    r"regexp_replace(?, '(\d{3})(\d{3})(\d{4})', '\1-\2-\3')",
                    [receiver()?.sql],
                ),
            )),
            "concat" => {
                let mut pieces = vec![receiver()?.sql];
                for i in 0..args.len() {
                    pieces.push(arg(i)?.sql);
                }
                let mut sql = Sql::raw("(");
                sql.append(Sql::join(pieces, " || "));
                sql.push_text(")");
                Ok(Value::new(Meta::String, sql))
            }

            "resolve" => match args {
                [Expr::Str(path)] => Ok(columns
                    .resolve(path)
                    .unwrap_or_else(|| Value::new(Meta::String, Sql::null()))),
                _ => Err(compile_error("resolve expects a single string literal")),
            },
            other => Err(compile_error(format!("unsupported function {other}"))),
        }
    }

    /// `calc<Record><Function>(record, ...)`: compile the callee's body with
    /// its parameters bound to the compiled arguments.
    fn inline(&self, name: &str, args: &[Expr], symbols: &Symbols, columns: &dyn Resolve) -> Result<Value> {
        let values = args
            .iter()
            .map(|a| self.compile(a, symbols, columns))
            .collect::<Result<Vec<_>>>()?;
        let record = values
            .first()
            .and_then(|v| v.meta.as_record())
            .cloned()
            .ok_or_else(|| compile_error(format!("{name}: first argument must be a record")))?;
        let function_name = name
            .strip_prefix("calc")
            .and_then(|rest| rest.strip_prefix(record.name.as_str()))
            .map(|rest| rest.to_lower_camel_case())
            .ok_or_else(|| compile_error(format!("{name} does not name a function of {}", record.name)))?;
        let def = record
            .function(&function_name)
            .ok_or_else(|| compile_error(format!("unknown function {name} for {}", record.name)))?;

        let key = format!("{}.{}", record.name, def.name);
        if self.inlining.borrow().contains(&key) {
            return Err(compile_error(format!("recursive inlining of {key}")));
        }
        self.inlining.borrow_mut().push(key);
        let result = self.apply(&def.body, values, columns);
        self.inlining.borrow_mut().pop();
        result
    }

    fn array(&self, name: &str, value: Value) -> Result<Value> {
        if value.meta.is_array() {
            Ok(value)
        } else {
            Err(compile_error(format!(
                "{name} expects an array, got {}",
                value.meta.kind()
            )))
        }
    }

    fn lambda(&self, expr: &Expr, base: &Value, alias: &str, symbols: &Symbols, columns: &dyn Resolve) -> Result<Value> {
        self.lambda_with(expr, base, Sql::raw(alias), symbols, columns)
    }

    /// Compile a one-parameter callback with its parameter bound to `item`.
    fn lambda_with(&self, expr: &Expr, base: &Value, item: Sql, symbols: &Symbols, columns: &dyn Resolve) -> Result<Value> {
        let (param, body) = match expr {
            Expr::Lambda { params, body } if params.len() == 1 => (&params[0], body),
            Expr::Lambda { params, .. } => {
                return Err(compile_error(format!(
                    "callbacks take exactly one parameter, got {}",
                    params.len()
                )))
            }
            other => return Err(compile_error(format!("expected a callback, got {other:?}"))),
        };
        let items = base
            .meta
            .items()
            .cloned()
            .ok_or_else(|| compile_error("callback over a non-array value"))?;
        let mut inner = symbols.clone();
        inner.insert(param.clone(), Value::new(items, item));
        self.compile(body, &inner, columns)
    }
}

fn arithmetic(op: &str, left: Value, right: Value) -> Value {
    let meta = if left.meta.is_money() || right.meta.is_money() {
        Meta::Money
    } else {
        Meta::Quantity
    };
    Value::new(meta, Sql::format(&format!("(? {op} ?)"), [left.sql, right.sql]))
}

fn divide(left: Value, right: Value) -> Value {
    Value::new(Meta::Percentage, Sql::format("(? / NULLIF(?, 0))", [left.sql, right.sql]))
}

fn compare(op: &str, left: Value, right: Value) -> Value {
    Value::new(Meta::Boolean, Sql::format(&format!("(? {op} ?)"), [left.sql, right.sql]))
}

fn days_since(value: Value) -> Value {
    Value::new(
        Meta::Quantity,
        Sql::format("(extract(epoch from age(?)) / (24*60*60))", [value.sql]),
    )
}

fn compile_error(message: impl Into<String>) -> RecordbaseError {
    RecordbaseError::Compile(message.into())
}

fn strip(err: RecordbaseError) -> String {
    match err {
        RecordbaseError::Compile(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_expression;
    use crate::meta::parse_model_str;
    use pretty_assertions::assert_eq;

    const MODEL: &str = r#"
constants:
  ROLE_MANAGER: 11111111-1111-4111-8111-111111111111
records:
  Person:
    fields:
      name: string
      happy: boolean
      age: quantity
  Item:
    fields:
      price: money
      quantity: quantity
  User:
    table: true
    fields:
      name: string
  Family:
    table: true
    fields:
      surname: string
      mother: Person
      children: Person[]
      items: Item[]
      tags: string[]
      manager: link<User>
      phone: phone
    functions:
      total:
        params: [Family]
        returns: money
        body: "(family) => sumMap(family.items, (item) => item.price.times(item.quantity))"
"#;

    fn compile_str(body: &str) -> Result<Value> {
        let model = parse_model_str(MODEL).unwrap();
        let compiler = Compiler::new(&model);
        let family = Meta::Record(model.record("Family").unwrap().clone());
        let expr = parse_expression(body).unwrap();
        compiler.apply(&expr, vec![Value::new(family, Sql::raw("families"))], &NoColumns)
    }

    #[test]
    fn test_field_projection() {
        let value = compile_str("(f) => f.mother.name").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(value.sql.to_inline(), "(families.\"mother\").\"name\"");
    }

    #[test]
    fn test_sum_map_money() {
        let value = compile_str("(f) => sumMap(f.items, (item) => item.price.times(item.quantity))").unwrap();
        assert_eq!(value.meta, Meta::Money);
        assert_eq!(
            value.sql.to_inline(),
            "coalesce((select sum((T1.\"price\" * T1.\"quantity\")) from unnest(families.\"items\") as T1), 0)"
        );
    }

    #[test]
    fn test_map_and_filter() {
        let value = compile_str("(f) => f.children.filter((c) => c.happy).map((c) => c.name)").unwrap();
        assert_eq!(value.meta, Meta::Array(Box::new(Meta::String)));
        assert_eq!(
            value.sql.to_inline(),
            "(select coalesce(array_agg(T2.\"name\"),'{}') from unnest(array(select T1 from unnest(families.\"children\") as T1 where T1.\"happy\")) as T2)"
        );
    }

    #[test]
    fn test_any_and_join() {
        let value = compile_str("(f) => anyMap(f.children, (c) => c.happy)").unwrap();
        assert_eq!(value.meta, Meta::Boolean);
        assert!(value.sql.to_inline().starts_with("coalesce((select bool_or(T1.\"happy\")"));

        let value = compile_str("(f) => joinMap(f.children, ', ', (c) => c.name)").unwrap();
        assert_eq!(value.meta, Meta::String);
        let (text, params) = value.sql.to_numbered();
        assert_eq!(
            text,
            "coalesce((select string_agg(T1.\"name\", $1) from unnest(families.\"children\") as T1), '')"
        );
        assert_eq!(params, vec![Some(", ".to_string())]);
    }

    #[test]
    fn test_division_is_percentage() {
        let value = compile_str("(f) => f.mother.age.dividedBy(f.mother.age)").unwrap();
        assert_eq!(value.meta, Meta::Percentage);
        assert!(value.sql.to_inline().contains("/ NULLIF("));
    }

    #[test]
    fn test_plus_on_strings_concatenates() {
        let value = compile_str("(f) => f.surname + ' family'").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(value.sql.to_inline(), "(families.\"surname\" || ' family')");
    }

    #[test]
    fn test_compare_with_null() {
        let value = compile_str("(f) => f.manager === null").unwrap();
        assert_eq!(value.sql.to_inline(), "(families.\"manager\" IS NULL)");
    }

    #[test]
    fn test_link_traversal() {
        let value = compile_str("(f) => f.manager.name").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(
            value.sql.to_inline(),
            "(select T1.\"name\" from users T1 where T1.id = families.\"manager\")"
        );
    }

    #[test]
    fn test_constants_and_uuid_passthrough() {
        let value = compile_str("(f) => f.manager.uuid === ROLES.ROLE_MANAGER").unwrap();
        assert_eq!(
            value.sql.to_inline(),
            "(families.\"manager\" = '11111111-1111-4111-8111-111111111111')"
        );
    }

    #[test]
    fn test_template_and_conditional() {
        let value = compile_str("(f) => f.mother.happy ? `${f.mother.name}!` : 'sad'").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(
            value.sql.to_inline(),
            "(case when (families.\"mother\").\"happy\" then ('' || (families.\"mother\").\"name\" || '!') else 'sad' end)"
        );
    }

    #[test]
    fn test_calc_inlines_callee() {
        let value = compile_str("(f) => calcFamilyTotal(f).plus(new Decimal('1'))").unwrap();
        assert_eq!(value.meta, Meta::Money);
        assert!(value.sql.to_inline().contains("sum((T1.\"price\" * T1.\"quantity\"))"));
        assert!(value.sql.to_inline().ends_with(" + '1'::decimal)"));
    }

    #[test]
    fn test_set_difference_and_phone_format() {
        let value = compile_str("(f) => setDifference(f.tags, ['a'])").unwrap();
        assert_eq!(value.meta, Meta::Array(Box::new(Meta::String)));
        assert!(value.sql.to_inline().contains("<> all(coalesce(ARRAY['a'], '{}'))"));

        let value = compile_str("(f) => f.phone.format()").unwrap();
        assert!(value.sql.to_inline().starts_with("regexp_replace(families.\"phone\", "));
    }

    #[test]
    fn test_resolve_falls_back_to_null() {
        let value = compile_str("(f) => resolve('nothing.here')").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(value.sql.to_inline(), "NULL");
    }

    #[test]
    fn test_compile_errors() {
        assert!(compile_str("(f) => sumMap(f.surname, (x) => x)").is_err());
        assert!(compile_str("(f) => f.nope").is_err());
        assert!(compile_str("(f) => g.surname").is_err());
        assert!(compile_str("(f) => f.children.map((a, b) => a)").is_err());
        assert!(compile_str("(f) => frobnicate(f)").is_err());
        assert!(compile_str("(f, g) => f").is_err());
    }
}
