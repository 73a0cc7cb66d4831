//! Structured statements.
//!
//! Table and document CRUD share one message shape; the data model flag
//! tells the server whether the target is relational.

use crate::error::ProtocolError;
use crate::message::ClientMessageType;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statement kind, mapped one-to-one onto a client message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Find,
    Insert,
    Update,
    Delete,
    Sql,
}

impl StatementKind {
    pub fn message_type(&self) -> ClientMessageType {
        match self {
            StatementKind::Find => ClientMessageType::CrudFind,
            StatementKind::Insert => ClientMessageType::CrudInsert,
            StatementKind::Update => ClientMessageType::CrudUpdate,
            StatementKind::Delete => ClientMessageType::CrudDelete,
            StatementKind::Sql => ClientMessageType::SqlStmtExecute,
        }
    }

    pub fn from_message_type(msg_type: ClientMessageType) -> Option<Self> {
        match msg_type {
            ClientMessageType::CrudFind => Some(StatementKind::Find),
            ClientMessageType::CrudInsert => Some(StatementKind::Insert),
            ClientMessageType::CrudUpdate => Some(StatementKind::Update),
            ClientMessageType::CrudDelete => Some(StatementKind::Delete),
            ClientMessageType::SqlStmtExecute => Some(StatementKind::Sql),
            _ => None,
        }
    }
}

/// Whether the target collection is a relational table or a document store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataModel {
    #[default]
    Table,
    Document,
}

/// Target collection (schema-qualified).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// Parameter bindings: positional or named, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bindings {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl Bindings {
    pub fn is_empty(&self) -> bool {
        match self {
            Bindings::None => true,
            Bindings::Positional(v) => v.is_empty(),
            Bindings::Named(m) => m.is_empty(),
        }
    }
}

/// Row limit and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub row_count: u64,
    #[serde(default)]
    pub offset: u64,
}

/// Sort direction for an order expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub expr: String,
    #[serde(default)]
    pub descending: bool,
}

/// A single update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpdateOperation {
    Set { path: String, value: Value },
    Unset { path: String },
    ArrayAppend { path: String, value: Value },
    MergePatch { patch: serde_json::Value },
}

/// A structured request. Immutable once submitted for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    #[serde(default)]
    pub collection: Collection,
    #[serde(default)]
    pub data_model: DataModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projection: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub having: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    #[serde(default, skip_serializing_if = "Bindings::is_empty")]
    pub args: Bindings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<UpdateOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

impl Statement {
    fn new(kind: StatementKind, collection: Collection, data_model: DataModel) -> Self {
        Self {
            kind,
            collection,
            data_model,
            criteria: None,
            projection: Vec::new(),
            group_by: Vec::new(),
            having: None,
            order: Vec::new(),
            limit: None,
            args: Bindings::None,
            rows: Vec::new(),
            operations: Vec::new(),
            sql: None,
        }
    }

    pub fn find(collection: Collection, data_model: DataModel) -> Self {
        Self::new(StatementKind::Find, collection, data_model)
    }

    pub fn insert(collection: Collection, data_model: DataModel) -> Self {
        Self::new(StatementKind::Insert, collection, data_model)
    }

    pub fn update(collection: Collection, data_model: DataModel) -> Self {
        Self::new(StatementKind::Update, collection, data_model)
    }

    pub fn delete(collection: Collection, data_model: DataModel) -> Self {
        Self::new(StatementKind::Delete, collection, data_model)
    }

    /// Raw SQL text, with optional positional bindings.
    pub fn sql(text: impl Into<String>) -> Self {
        let mut stmt = Self::new(StatementKind::Sql, Collection::default(), DataModel::Table);
        stmt.sql = Some(text.into());
        stmt
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = Some(criteria.into());
        self
    }

    pub fn with_projection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_having(mut self, having: impl Into<String>) -> Self {
        self.having = Some(having.into());
        self
    }

    pub fn with_order(mut self, expr: impl Into<String>, descending: bool) -> Self {
        self.order.push(Order {
            expr: expr.into(),
            descending,
        });
        self
    }

    pub fn with_limit(mut self, row_count: u64, offset: u64) -> Self {
        self.limit = Some(Limit { row_count, offset });
        self
    }

    pub fn with_row<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rows.push(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_operation(mut self, op: UpdateOperation) -> Self {
        self.operations.push(op);
        self
    }

    /// Binds the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Result<Self, ProtocolError> {
        match &mut self.args {
            Bindings::None => self.args = Bindings::Positional(vec![value.into()]),
            Bindings::Positional(values) => values.push(value.into()),
            Bindings::Named(_) => return Err(ProtocolError::MixedBindings),
        }
        Ok(self)
    }

    /// Binds a named parameter.
    pub fn bind_named(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        match &mut self.args {
            Bindings::None => {
                let mut map = BTreeMap::new();
                map.insert(name.into(), value.into());
                self.args = Bindings::Named(map);
            }
            Bindings::Named(map) => {
                map.insert(name.into(), value.into());
            }
            Bindings::Positional(_) => return Err(ProtocolError::MixedBindings),
        }
        Ok(self)
    }

    /// Returns whether executing the statement may produce rows.
    pub fn returns_rows(&self) -> bool {
        matches!(self.kind, StatementKind::Find | StatementKind::Sql)
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match (&self.kind, &self.sql) {
            (StatementKind::Sql, Some(sql)) => format!("sql `{}`", sql),
            _ => format!("{:?} {}", self.kind, self.collection.name).to_lowercase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bindings_are_exclusive() {
        let stmt = Statement::find(Collection::new("users"), DataModel::Table)
            .with_criteria("age > ?")
            .bind(30)
            .unwrap();
        assert_eq!(stmt.args, Bindings::Positional(vec![Value::Sint(30)]));
        assert!(matches!(
            stmt.bind_named("name", "bob"),
            Err(ProtocolError::MixedBindings)
        ));

        let stmt = Statement::find(Collection::new("docs"), DataModel::Document)
            .bind_named("name", "bob")
            .unwrap();
        assert!(matches!(stmt.bind(1), Err(ProtocolError::MixedBindings)));
    }

    #[test]
    fn test_shared_shape_differs_only_in_model() {
        let table = Statement::find(Collection::new("t"), DataModel::Table).with_limit(10, 5);
        let doc = Statement::find(Collection::new("t"), DataModel::Document).with_limit(10, 5);

        let mut table_json = serde_json::to_value(&table).unwrap();
        let mut doc_json = serde_json::to_value(&doc).unwrap();
        assert_eq!(table_json["data_model"], json!("table"));
        assert_eq!(doc_json["data_model"], json!("document"));

        table_json.as_object_mut().unwrap().remove("data_model");
        doc_json.as_object_mut().unwrap().remove("data_model");
        assert_eq!(table_json, doc_json);
    }

    #[test]
    fn test_statement_serialization_skips_empty_parts() {
        let stmt = Statement::delete(Collection::new("t").in_schema("s"), DataModel::Table)
            .with_criteria("id = 1");
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "delete",
                "collection": {"schema": "s", "name": "t"},
                "data_model": "table",
                "criteria": "id = 1"
            })
        );
    }

    #[test]
    fn test_kind_message_type_mapping() {
        for kind in [
            StatementKind::Find,
            StatementKind::Insert,
            StatementKind::Update,
            StatementKind::Delete,
            StatementKind::Sql,
        ] {
            assert_eq!(
                StatementKind::from_message_type(kind.message_type()),
                Some(kind)
            );
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(Statement::sql("SELECT 1").describe(), "sql `SELECT 1`");
        assert_eq!(
            Statement::insert(Collection::new("Users"), DataModel::Table).describe(),
            "insert users"
        );
    }
}
