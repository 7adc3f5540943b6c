//! Change events produced by the decoder and consumed by the router

use crate::{OpsyncError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Source tables the consumer knows how to replicate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Entity {
    Order,
    OrderItem,
    Customer,
    Product,
}

impl Entity {
    /// Map a source table name (without schema) to an entity.
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "orders" => Some(Entity::Order),
            "order_items" => Some(Entity::OrderItem),
            "customers" => Some(Entity::Customer),
            "products" => Some(Entity::Product),
            _ => None,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Entity::Order => "orders",
            Entity::OrderItem => "order_items",
            Entity::Customer => "customers",
            Entity::Product => "products",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Order => "Order",
            Entity::OrderItem => "OrderItem",
            Entity::Customer => "Customer",
            Entity::Product => "Product",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row operations that are replicated. Deletes are never decoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
}

impl OperationKind {
    /// Parse the operation keyword of a change record. `DELETE`, `TRUNCATE`
    /// and anything else yield `None`.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_uppercase().as_str() {
            "INSERT" => Some(OperationKind::Insert),
            "UPDATE" => Some(OperationKind::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
        }
    }
}

/// Column values of a change, kept as raw strings. Coercion happens in the
/// apply step for each entity, which knows the expected shape of its table.
///
/// Columns whose value the change did not carry (unchanged TOAST values) are
/// tracked apart so the stored value can be kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMap {
    values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    unchanged: BTreeSet<String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        self.unchanged.remove(&column);
        self.values.insert(column, value.into());
    }

    /// Record that the change left `column` as it was.
    pub fn mark_unchanged(&mut self, column: impl Into<String>) {
        let column = column.into();
        self.values.remove(&column);
        self.unchanged.insert(column);
    }

    pub fn is_unchanged(&self, column: &str) -> bool {
        self.unchanged.contains(column)
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.unchanged.clear();
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Look up a column that must be present.
    pub fn require(&self, column: &str) -> Result<&str> {
        self.get(column)
            .ok_or_else(|| OpsyncError::Decode(format!("missing column '{}'", column)))
    }

    /// Look up and parse a column that must be present.
    pub fn parse<T>(&self, column: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.require(column)?;
        raw.parse::<T>().map_err(|e| {
            OpsyncError::Decode(format!("column '{}' value '{}': {}", column, raw, e))
        })
    }

    /// Parse a column if present; an absent column is `None`, a malformed one
    /// is still an error.
    pub fn parse_opt<T>(&self, column: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(column) {
            Some(_) => self.parse(column).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One decoded change record. Built by the decoder, consumed by the router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub entity: Entity,
    pub operation: OperationKind,
    pub fields: FieldMap,
}

impl ChangeEvent {
    pub fn new(entity: Entity, operation: OperationKind, fields: FieldMap) -> Self {
        Self {
            entity,
            operation,
            fields,
        }
    }
}
