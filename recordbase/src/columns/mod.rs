//! Column trees.
//!
//! Every table gets a tree of resolvable columns: its fields, computed
//! functions, reverse relationships, and (through link fields) the columns
//! of linked tables. Trees are built once per model into an arena and never
//! mutated afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::compiler::{Compiler, Resolve, Value};
use crate::error::{RecordbaseError, Result};
use crate::meta::{Meta, Model, ParamType, RecordMeta};
use crate::naming;
use crate::sql::{field_access, Sql, SUBKEY_VAR};

pub type ColumnId = usize;

/// One node of a column tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub meta: Meta,
    pub expression: Sql,
    /// Type of the query-time key for parameterized columns (`column@key`).
    pub subkey: Option<Meta>,
    pub children: BTreeMap<String, ColumnId>,
}

/// A dotted path as listed by [`ColumnTree::describe_columns`].
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescription {
    pub path: String,
    pub kind: &'static str,
    pub subkey: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnTree {
    columns: Vec<Column>,
    roots: BTreeMap<String, ColumnId>,
}

/// Alias under which the `index`-th segment array is joined.
pub fn segment_alias(index: usize) -> String {
    format!("S{index}")
}

impl ColumnTree {
    /// Build the trees of every table and table segment. Compile errors in
    /// computed fields surface here.
    pub fn build(model: &Model) -> Result<Self> {
        let mut builder = TreeBuilder {
            model,
            compiler: Compiler::new(model),
            columns: Vec::new(),
        };
        let mut roots = BTreeMap::new();
        for record in model.tables() {
            let root = builder.table_root(record, &HashMap::new())?;
            roots.insert(record.name.clone(), root);

            for (segment, paths) in &record.segments {
                let overrides = paths
                    .iter()
                    .enumerate()
                    .map(|(index, path)| (path.clone(), Sql::raw(format!("{}.item", segment_alias(index)))))
                    .collect();
                let root = builder.table_root(record, &overrides)?;
                roots.insert(format!("{}@{segment}", record.name), root);
            }
        }
        log::debug!("built {} columns for {} roots", builder.columns.len(), roots.len());
        Ok(ColumnTree {
            columns: builder.columns,
            roots,
        })
    }

    pub fn get(&self, id: ColumnId) -> &Column {
        &self.columns[id]
    }

    pub fn child(&self, id: ColumnId, name: &str) -> Option<ColumnId> {
        self.columns[id].children.get(name).copied()
    }

    pub fn root(&self, table: &str, segment: Option<&str>) -> Result<ColumnId> {
        let key = match segment {
            Some(segment) => format!("{table}@{segment}"),
            None => table.to_string(),
        };
        self.roots
            .get(&key)
            .copied()
            .ok_or_else(|| RecordbaseError::InvalidRequest(format!("unknown table or segment '{key}'")))
    }

    /// Resolve a dotted column path into its SQL and meta.
    ///
    /// A trailing `.` selects the whole value of a linked record, and
    /// `name@key` binds the key of a parameterized column.
    pub fn resolve_path(&self, table: &str, segment: Option<&str>, path: &str) -> Result<Value> {
        let invalid = || RecordbaseError::InvalidColumn {
            column: path.to_string(),
        };
        let mut node = self.root(table, segment)?;
        let (body, whole) = match path.strip_suffix('.') {
            Some(body) => (body, true),
            None => (path, false),
        };
        let mut env = HashMap::new();
        if !body.is_empty() {
            for part in body.split('.') {
                let name = match part.split_once('@') {
                    Some((name, key)) => {
                        env.insert(SUBKEY_VAR.to_string(), Sql::param(key));
                        name
                    }
                    None => part,
                };
                node = self.child(node, name).ok_or_else(invalid)?;
            }
        }
        if whole {
            node = self.child(node, ".").ok_or_else(invalid)?;
        }
        let column = self.get(node);
        let sql = column.expression.bind(&env).map_err(|_| invalid())?;
        Ok(Value::new(column.meta.clone(), sql))
    }

    /// Every path reachable in a table's tree.
    pub fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescription>> {
        let root = self.root(table, None)?;
        let mut out = Vec::new();
        let mut stack: Vec<(String, ColumnId)> = self.columns[root]
            .children
            .iter()
            .rev()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        while let Some((path, id)) = stack.pop() {
            let column = &self.columns[id];
            out.push(ColumnDescription {
                path: path.clone(),
                kind: column.meta.kind(),
                subkey: column.subkey.as_ref().map(|meta| match meta {
                    Meta::Uuid { link_to: Some(target) } => target.clone(),
                    other => other.kind().to_string(),
                }),
            });
            if path == "." {
                continue;
            }
            for (name, child) in column.children.iter().rev() {
                stack.push((format!("{path}.{name}"), *child));
            }
        }
        Ok(out)
    }
}

// ── Construction ────────────────────────────────────────────────────

type Scope = HashMap<String, Value>;

struct TreeBuilder<'m> {
    model: &'m Model,
    compiler: Compiler<'m>,
    columns: Vec<Column>,
}

/// Sibling columns visible to `resolve("path")` while a record's functions
/// are compiled.
struct Siblings<'a> {
    columns: &'a [Column],
    node: ColumnId,
}

impl Resolve for Siblings<'_> {
    fn resolve(&self, path: &str) -> Option<Value> {
        let mut node = self.node;
        for part in path.split('.') {
            node = *self.columns[node].children.get(part)?;
        }
        let column = &self.columns[node];
        Some(Value::new(column.meta.clone(), column.expression.clone()))
    }
}

impl<'m> TreeBuilder<'m> {
    fn push(&mut self, meta: Meta, expression: Sql) -> ColumnId {
        self.columns.push(Column {
            meta,
            expression,
            subkey: None,
            children: BTreeMap::new(),
        });
        self.columns.len() - 1
    }

    fn attach(&mut self, parent: ColumnId, name: impl Into<String>, child: ColumnId) {
        self.columns[parent].children.insert(name.into(), child);
    }

    fn table_root(&mut self, record: &Arc<RecordMeta>, segments: &HashMap<String, Sql>) -> Result<ColumnId> {
        let value = Sql::raw(record.table_name());
        let meta = Meta::Record(record.clone());
        let root = self.push(meta.clone(), value.clone());
        let seen = vec![record.name.clone()];
        self.record_children(root, record, &value, &seen, &Scope::new(), segments)?;

        let itself = self.push(meta, value);
        self.attach(root, ".", itself);
        let null = self.push(Meta::String, Sql::null());
        self.attach(root, "null", null);
        Ok(root)
    }

    /// Tables with a link field named after `record`, as (table, field).
    fn reverse_links(&self, record: &RecordMeta) -> Vec<(Arc<RecordMeta>, String)> {
        use heck::ToLowerCamelCase;
        let key = record.name.to_lower_camel_case();
        self.model
            .tables()
            .filter(|table| {
                matches!(table.field(&key), Some(Meta::Uuid { link_to: Some(target) }) if *target == record.name)
            })
            .map(|table| (table.clone(), key.clone()))
            .collect()
    }

    fn record_children(
        &mut self,
        node: ColumnId,
        record: &Arc<RecordMeta>,
        value: &Sql,
        seen: &[String],
        scope: &Scope,
        segments: &HashMap<String, Sql>,
    ) -> Result<()> {
        let mut scope = scope.clone();
        scope.insert(record.name.clone(), Value::new(Meta::Record(record.clone()), value.clone()));

        for (source, field) in self.reverse_links(record) {
            let alias = self.compiler.fresh_alias();
            let table = source.table_name();
            let link = field_access(&Sql::raw(alias.clone()), &naming::column_name(&field));
            let related = Sql::format(
                &format!("(select coalesce(array_agg({alias}), '{{}}') from {table} {alias} where ? = ?)"),
                [link, field_access(value, "id")],
            );
            let meta = Meta::Array(Box::new(Meta::Record(source.clone())));
            let id = self.push(meta.clone(), related.clone());
            self.attach(node, naming::relationship_name(&source.name), id);
            scope.insert(format!("{}[]", source.name), Value::new(meta, related));

            if seen.len() == 1 && source.field("number").is_some() {
                let alias = self.compiler.fresh_alias();
                let link = field_access(&Sql::raw(alias.clone()), &naming::column_name(&field));
                let latest = Sql::format(
                    &format!("(select {alias} from {table} {alias} where ? = ? order by {alias}.\"number\" desc limit 1)"),
                    [link, field_access(value, "id")],
                );
                let id = self.push(Meta::Record(source.clone()), latest.clone());
                let mut inner_seen = seen.to_vec();
                inner_seen.push(source.name.clone());
                self.record_children(id, &source, &latest, &inner_seen, &scope, &HashMap::new())?;
                self.attach(node, format!("last{}", source.name), id);
            }
        }

        for (key, meta) in &record.fields {
            if record.function(key).is_some() {
                continue;
            }
            let id = match segments.get(key) {
                Some(item) => {
                    let items = meta.items().ok_or_else(|| {
                        RecordbaseError::Schema(format!("segment column {}.{key} is not an array", record.name))
                    })?;
                    self.expand(items.clone(), item.clone(), seen, &scope)?
                }
                None => {
                    let expression = field_access(value, &naming::column_name(key));
                    self.expand(meta.clone(), expression, seen, &scope)?
                }
            };
            self.attach(node, key.clone(), id);
        }

        for def in &record.functions {
            let mut args = Vec::new();
            let mut subkey = None;
            for param in &def.params {
                let arg = match param {
                    ParamType::Record(name) => scope.get(name).cloned(),
                    ParamType::RecordArray(name) => scope.get(&format!("{name}[]")).cloned(),
                    ParamType::Key { link_to } => {
                        let meta = Meta::Uuid {
                            link_to: link_to.clone(),
                        };
                        subkey = Some(meta.clone());
                        Some(Value::new(meta, Sql::var(SUBKEY_VAR)))
                    }
                };
                let arg = arg.ok_or_else(|| {
                    RecordbaseError::Compile(format!(
                        "{}.{}: no value for parameter {param:?} in scope",
                        record.name, def.name
                    ))
                })?;
                args.push(arg);
            }
            let compiled = {
                let siblings = Siblings {
                    columns: &self.columns,
                    node,
                };
                self.compiler.function(&record.name, def, args, &siblings)?
            };
            let id = match segments.get(&def.name) {
                Some(item) => {
                    let items = compiled.meta.items().ok_or_else(|| {
                        RecordbaseError::Schema(format!("segment column {}.{} is not an array", record.name, def.name))
                    })?;
                    self.expand(items.clone(), item.clone(), seen, &scope)?
                }
                None => self.expand(compiled.meta, compiled.sql, seen, &scope)?,
            };
            self.columns[id].subkey = subkey;
            self.attach(node, def.name.clone(), id);
        }
        Ok(())
    }

    fn expand(&mut self, meta: Meta, value: Sql, seen: &[String], scope: &Scope) -> Result<ColumnId> {
        match meta {
            Meta::Record(ref record) => {
                let record = record.clone();
                let id = self.push(meta, value.clone());
                self.record_children(id, &record, &value, seen, scope, &HashMap::new())?;
                Ok(id)
            }
            Meta::Uuid { link_to: Some(ref target) }
                if !seen.contains(target) && seen.len() < 3 && self.model.table(target).is_some() =>
            {
                let target = target.clone();
                let id = self.push(meta, value.clone());
                self.link_children(id, &target, &value, seen)?;
                Ok(id)
            }
            Meta::Array(ref items) => {
                let items = (**items).clone();
                let id = self.push(meta, value.clone());
                let alias = self.compiler.fresh_alias();
                let item = self.expand(items, Sql::raw(alias.clone()), seen, scope)?;
                let children = std::mem::take(&mut self.columns[item].children);
                for child in children.values() {
                    self.wrap_descendants(*child, &|column: &Column| {
                        let expression = Sql::format(
                            &format!("(select coalesce(array_agg(?), '{{}}') from unnest(?) as {alias})"),
                            [column.expression.clone(), value.clone()],
                        );
                        (Meta::Array(Box::new(column.meta.clone())), expression)
                    });
                }
                self.columns[id].children = children;
                Ok(id)
            }
            Meta::Null | Meta::OptionalArray(_) | Meta::Binary => Ok(self.push(Meta::String, Sql::null())),
            other => Ok(self.push(other, value)),
        }
    }

    /// Columns of the linked table, each read through a correlated
    /// subquery on the link value.
    fn link_children(&mut self, id: ColumnId, target: &str, value: &Sql, seen: &[String]) -> Result<()> {
        let linked = self
            .model
            .table(target)
            .cloned()
            .ok_or_else(|| RecordbaseError::Schema(format!("link target {target} is not a table")))?;
        let table = linked.table_name();
        let alias = self.compiler.fresh_alias();
        let mut inner_seen = seen.to_vec();
        inner_seen.push(target.to_string());

        let inner = self.push(Meta::Record(linked.clone()), Sql::raw(alias.clone()));
        self.record_children(inner, &linked, &Sql::raw(alias.clone()), &inner_seen, &Scope::new(), &HashMap::new())?;
        let children = std::mem::take(&mut self.columns[inner].children);
        for child in children.values() {
            self.wrap_descendants(*child, &|column: &Column| {
                let expression = Sql::format(
                    &format!("(select ? from {table} {alias} where {alias}.id = ?)"),
                    [column.expression.clone(), value.clone()],
                );
                (column.meta.clone(), expression)
            });
        }
        self.columns[id].children = children;

        let whole = Sql::format(
            &format!("(select {alias} from {table} {alias} where {alias}.id = ?)"),
            [value.clone()],
        );
        let itself = self.push(Meta::Record(linked), whole);
        self.attach(id, ".", itself);
        Ok(())
    }

    fn wrap_descendants(&mut self, id: ColumnId, wrap: &dyn Fn(&Column) -> (Meta, Sql)) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let (meta, expression) = wrap(&self.columns[id]);
            let column = &mut self.columns[id];
            column.meta = meta;
            column.expression = expression;
            stack.extend(column.children.values().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::parse_model_str;
    use pretty_assertions::assert_eq;

    const MODEL: &str = r#"
records:
  Person:
    fields:
      name: string
      happy: boolean
  User:
    table: true
    fields:
      name: string
  Role:
    fields:
      role: uuid
      user: link<User>
  Family:
    table: true
    fields:
      surname: string
      mother: Person
      children: Person[]
      manager: link<User>
      personnel: Role[]
      photo: binary
    functions:
      happyChildren:
        params: [Family]
        returns: quantity
        body: "(family) => sumMap(family.children, (child) => child.happy ? 1 : 0)"
      petCount:
        params: [Family, "Pet[]"]
        returns: quantity
        body: "(family, pets) => sumMap(pets, (pet) => 1)"
      personnelByRole:
        params: [Family, uuid]
        returns: link<User>
        body: "(family, role) => firstMatch(family.personnel, (p) => p.role === role, (p) => p.user)"
    segments:
      byChild: [children]
  Pet:
    table: true
    fields:
      name: string
      family: link<Family>
      number: serial
"#;

    fn tree() -> (Model, ColumnTree) {
        let model = parse_model_str(MODEL).unwrap();
        let tree = ColumnTree::build(&model).unwrap();
        (model, tree)
    }

    #[test]
    fn test_field_columns() {
        let (_, tree) = tree();
        let value = tree.resolve_path("Family", None, "mother.name").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(value.sql.to_inline(), "(families.\"mother\").\"name\"");

        let value = tree.resolve_path("Family", None, "surname").unwrap();
        assert_eq!(value.sql.to_inline(), "families.\"surname\"");
    }

    #[test]
    fn test_root_special_columns() {
        let (_, tree) = tree();
        let itself = tree.resolve_path("Family", None, ".").unwrap();
        assert_eq!(itself.sql.to_inline(), "families");
        assert!(matches!(itself.meta, Meta::Record(_)));

        let null = tree.resolve_path("Family", None, "null").unwrap();
        assert_eq!(null.meta, Meta::String);
        assert_eq!(null.sql.to_inline(), "NULL");

        let photo = tree.resolve_path("Family", None, "photo").unwrap();
        assert_eq!(photo.sql.to_inline(), "NULL");
    }

    #[test]
    fn test_array_item_columns_aggregate() {
        let (_, tree) = tree();
        let value = tree.resolve_path("Family", None, "children.name").unwrap();
        assert_eq!(value.meta, Meta::Array(Box::new(Meta::String)));
        let text = value.sql.to_inline();
        assert!(text.starts_with("(select coalesce(array_agg(T"), "{text}");
        assert!(text.contains(" from unnest(families.\"children\") as T"), "{text}");
    }

    #[test]
    fn test_link_columns() {
        let (_, tree) = tree();
        let value = tree.resolve_path("Family", None, "manager.name").unwrap();
        assert_eq!(value.meta, Meta::String);
        let text = value.sql.to_inline();
        assert!(text.starts_with("(select T"), "{text}");
        assert!(text.contains(" from users T"));
        assert!(text.ends_with(".id = families.\"manager\")"));

        let whole = tree.resolve_path("Family", None, "manager.").unwrap();
        assert!(matches!(&whole.meta, Meta::Record(r) if r.name == "User"));
    }

    #[test]
    fn test_reverse_relationship_and_latest() {
        let (_, tree) = tree();
        let pets = tree.resolve_path("Family", None, "pets").unwrap();
        assert!(matches!(&pets.meta, Meta::Array(items) if matches!(&**items, Meta::Record(r) if r.name == "Pet")));
        let text = pets.sql.to_inline();
        assert!(text.contains("from pets T"), "{text}");
        assert!(text.ends_with(" = families.\"id\")"), "{text}");

        let latest = tree.resolve_path("Family", None, "lastPet.name").unwrap();
        assert_eq!(latest.meta, Meta::String);
        assert!(latest.sql.to_inline().contains("order by"));

        let count = tree.resolve_path("Family", None, "petCount").unwrap();
        assert_eq!(count.meta, Meta::Quantity);
        assert!(count.sql.to_inline().contains("from pets T"));
    }

    #[test]
    fn test_subkey_column_binds_key() {
        let (_, tree) = tree();
        let root = tree.root("Family", None).unwrap();
        let id = tree.child(root, "personnelByRole").unwrap();
        assert_eq!(
            tree.get(id).subkey,
            Some(Meta::Uuid { link_to: None })
        );

        let value = tree.resolve_path("Family", None, "personnelByRole@abc.name").unwrap();
        let (text, params) = value.sql.to_numbered();
        assert!(!text.contains(SUBKEY_VAR));
        assert!(params.contains(&Some("abc".to_string())));

        let err = tree.resolve_path("Family", None, "personnelByRole").unwrap_err();
        assert_eq!(err.status(), "INVALID_COLUMN");
    }

    #[test]
    fn test_segment_root_uses_item_alias() {
        let (_, tree) = tree();
        let value = tree.resolve_path("Family", Some("byChild"), "children.name").unwrap();
        assert_eq!(value.meta, Meta::String);
        assert_eq!(value.sql.to_inline(), "(S0.item).\"name\"");
    }

    #[test]
    fn test_unknown_column() {
        let (_, tree) = tree();
        let err = tree.resolve_path("Family", None, "mother.shoeSize").unwrap_err();
        assert_eq!(err.status(), "INVALID_COLUMN");
        let err = tree.resolve_path("Nope", None, "x").unwrap_err();
        assert_eq!(err.status(), "INVALID_REQUEST");
    }

    #[test]
    fn test_describe_columns() {
        let (_, tree) = tree();
        let columns = tree.describe_columns("Family").unwrap();
        let paths: Vec<&str> = columns.iter().map(|c| c.path.as_str()).collect();
        assert!(paths.contains(&"mother.name"));
        assert!(paths.contains(&"manager.name"));
        assert!(paths.contains(&"pets"));
        assert!(paths.contains(&"happyChildren"));
        let keyed = columns.iter().find(|c| c.path == "personnelByRole").unwrap();
        assert_eq!(keyed.subkey.as_deref(), Some("uuid"));
    }

    #[test]
    fn test_compile_errors_fail_the_build() {
        let model = parse_model_str(
            r#"
records:
  Thing:
    table: true
    fields:
      name: string
    functions:
      broken:
        params: [Thing]
        returns: quantity
        body: "(thing) => sumMap(thing.name, (c) => 1)"
"#,
        )
        .unwrap();
        let err = ColumnTree::build(&model).unwrap_err();
        assert!(matches!(err, RecordbaseError::Compile(_)));
    }
}
