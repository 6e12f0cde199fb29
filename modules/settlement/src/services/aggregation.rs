//! Order aggregation
//!
//! Groups order-level rows by order id and sums sales and refunds separately.
//! Sales and refunds of the same order are never netted against each other.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::models::{noise_threshold, SettlementRow};

pub const SALES_TYPES: &[&str] = &["order", "order_retrocharge"];
pub const REFUND_TYPES: &[&str] = &["refund"];

pub fn is_sales_type(transaction_type: &str) -> bool {
    SALES_TYPES.contains(&transaction_type.trim().to_lowercase().as_str())
}

pub fn is_refund_type(transaction_type: &str) -> bool {
    REFUND_TYPES.contains(&transaction_type.trim().to_lowercase().as_str())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderAggregates {
    /// Order ids in first-appearance order
    pub order: Vec<String>,
    pub groups: HashMap<String, Vec<SettlementRow>>,
    /// Raw signed sum of sales rows, in first-appearance order
    pub sales_totals: Vec<(String, Decimal)>,
    /// Negated sum of refund rows (a positive magnitude for ordinary refunds)
    pub refund_totals: Vec<(String, Decimal)>,
}

impl OrderAggregates {
    pub fn from_rows(rows: &[SettlementRow]) -> Self {
        let mut aggregates = OrderAggregates::default();

        for row in rows {
            if !is_sales_type(&row.transaction_type) && !is_refund_type(&row.transaction_type) {
                continue;
            }
            let Some(order_id) = row.order_id.as_deref().map(str::trim).filter(|o| !o.is_empty()) else {
                continue;
            };
            if !aggregates.groups.contains_key(order_id) {
                aggregates.order.push(order_id.to_string());
            }
            aggregates
                .groups
                .entry(order_id.to_string())
                .or_default()
                .push(row.clone());
        }

        for order_id in &aggregates.order {
            let rows = &aggregates.groups[order_id];
            let sales: Decimal = rows
                .iter()
                .filter(|r| is_sales_type(&r.transaction_type))
                .map(|r| r.amount)
                .sum();
            let refunds: Decimal = -rows
                .iter()
                .filter(|r| is_refund_type(&r.transaction_type))
                .map(|r| r.amount)
                .sum::<Decimal>();

            if sales.abs() >= noise_threshold() {
                aggregates.sales_totals.push((order_id.clone(), sales));
            }
            if refunds.abs() >= noise_threshold() {
                aggregates.refund_totals.push((order_id.clone(), refunds));
            }
        }

        aggregates
    }

    pub fn sales_total(&self, order_id: &str) -> Option<Decimal> {
        self.sales_totals
            .iter()
            .find(|(o, _)| o == order_id)
            .map(|(_, amount)| *amount)
    }

    pub fn refund_total(&self, order_id: &str) -> Option<Decimal> {
        self.refund_totals
            .iter()
            .find(|(o, _)| o == order_id)
            .map(|(_, amount)| *amount)
    }

    pub fn total_sales(&self) -> Decimal {
        self.sales_totals.iter().map(|(_, a)| *a).sum()
    }

    pub fn total_refunds(&self) -> Decimal {
        self.refund_totals.iter().map(|(_, a)| *a).sum()
    }

    /// Sales minus refunds in settlement currency
    pub fn order_net(&self) -> Decimal {
        self.total_sales() - self.total_refunds()
    }

    pub fn rows(&self, order_id: &str) -> &[SettlementRow] {
        self.groups.get(order_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn refund_rows(&self, order_id: &str) -> Vec<SettlementRow> {
        self.rows(order_id)
            .iter()
            .filter(|r| is_refund_type(&r.transaction_type))
            .cloned()
            .collect()
    }

    /// Lower-cased marketplace name and merchant order id from the order's first row
    pub fn marketplace_fields(&self, order_id: &str) -> (String, String) {
        match self.rows(order_id).first() {
            Some(row) => (
                row.marketplace_name.clone().unwrap_or_default().trim().to_lowercase(),
                row.merchant_order_id.clone().unwrap_or_default().trim().to_string(),
            ),
            None => (String::new(), String::new()),
        }
    }
}
