//! Typed rows of the analytical store and the source rows they derive from

use crate::{FieldMap, OpsyncError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Denormalized fact row keyed by `(order_id, delivery_date)`.
///
/// `product_id` and `quantity` come from line items; an order header change
/// may not carry them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderFact {
    pub order_id: i64,
    pub delivery_date: NaiveDate,
    pub order_date: NaiveDate,
    pub customer_id: i64,
    pub status: String,
    pub product_id: Option<i64>,
    pub quantity: Option<i32>,
}

impl OrderFact {
    /// Build a fact from the columns of an `orders` change.
    pub fn from_order_fields(fields: &FieldMap) -> Result<Self> {
        Ok(Self {
            order_id: fields.parse("order_id")?,
            delivery_date: parse_date(fields, "delivery_date")?,
            order_date: parse_date(fields, "order_date")?,
            customer_id: fields.parse("customer_id")?,
            status: fields.require("status")?.to_string(),
            product_id: fields.parse_opt("product_id")?,
            quantity: fields.parse_opt("quantity")?,
        })
    }

    /// Natural key of the row.
    pub fn key(&self) -> (i64, NaiveDate) {
        (self.order_id, self.delivery_date)
    }
}

/// A line item joined with its order header, as read back from the source.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrderLine {
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub order_date: NaiveDate,
    pub delivery_date: NaiveDate,
    pub customer_id: i64,
    pub status: String,
}

impl From<OrderLine> for OrderFact {
    fn from(line: OrderLine) -> Self {
        Self {
            order_id: line.order_id,
            delivery_date: line.delivery_date,
            order_date: line.order_date,
            customer_id: line.customer_id,
            status: line.status,
            product_id: Some(line.product_id),
            quantity: Some(line.quantity),
        }
    }
}

/// Customer dimension row keyed by `customer_id`.
///
/// `preserved` lists store columns the change left untouched; their stored
/// value wins over the placeholder carried here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerDim {
    pub customer_id: i64,
    pub customer_name: String,
    pub is_active: bool,
    pub address: Option<String>,
    #[serde(default)]
    pub preserved: Vec<String>,
}

impl CustomerDim {
    pub fn from_fields(fields: &FieldMap) -> Result<Self> {
        let mut preserved = Vec::new();
        Ok(Self {
            customer_id: fields.parse("customer_id")?,
            customer_name: kept_text(fields, "customer_name", &mut preserved)?,
            is_active: parse_bool(fields, "is_active")?,
            address: kept_opt_text(fields, "customer_address", &mut preserved),
            preserved,
        })
    }
}

/// Product dimension row keyed by `product_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductDim {
    pub product_id: i64,
    pub product_name: String,
    pub barcode: Option<String>,
    pub unit_price: Decimal,
    pub is_active: bool,
    #[serde(default)]
    pub preserved: Vec<String>,
}

impl ProductDim {
    pub fn from_fields(fields: &FieldMap) -> Result<Self> {
        let mut preserved = Vec::new();
        Ok(Self {
            product_id: fields.parse("product_id")?,
            product_name: kept_text(fields, "product_name", &mut preserved)?,
            barcode: kept_opt_text(fields, "barcode", &mut preserved),
            // source column is spelled `unity_price`
            unit_price: fields.parse("unity_price")?,
            is_active: parse_bool(fields, "is_active")?,
            preserved,
        })
    }
}

/// A required text column, or an empty placeholder when it was not sent.
fn kept_text(fields: &FieldMap, column: &str, preserved: &mut Vec<String>) -> Result<String> {
    if fields.is_unchanged(column) {
        preserved.push(column.to_string());
        return Ok(String::new());
    }
    Ok(fields.require(column)?.to_string())
}

fn kept_opt_text(fields: &FieldMap, column: &str, preserved: &mut Vec<String>) -> Option<String> {
    if fields.is_unchanged(column) {
        preserved.push(column.to_string());
        return None;
    }
    fields.get(column).map(str::to_string)
}

/// Parse a date column. Timestamps are truncated to their date part.
pub fn parse_date(fields: &FieldMap, column: &str) -> Result<NaiveDate> {
    let raw = fields.require(column)?;
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|e| {
        OpsyncError::Decode(format!("column '{}' value '{}': {}", column, raw, e))
    })
}

/// Parse a boolean column in any of the spellings PostgreSQL emits or accepts.
pub fn parse_bool(fields: &FieldMap, column: &str) -> Result<bool> {
    let raw = fields.require(column)?;
    match raw.to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "y" | "yes" | "on" => Ok(true),
        "f" | "false" | "0" | "n" | "no" | "off" => Ok(false),
        _ => Err(OpsyncError::Decode(format!(
            "column '{}' value '{}' is not a boolean",
            column, raw
        ))),
    }
}
