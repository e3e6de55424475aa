//! The Persistence Gateway: the sole process-wide I/O boundary.
//!
//! Every other component addresses persistence exclusively through the
//! [`PersistenceGateway`] trait's five operations. Two backends implement it
//! ([`sqlite::SqliteGateway`] and [`rest::RestGateway`]); both must produce
//! identical results for the same filter, so higher components never branch
//! on which one is configured.

pub mod rest;
pub mod sqlite;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Comparison operators supported by the fixed filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `column = value`
    Eq,
    /// `column > value`
    Gt,
    /// `column >= value`
    Gte,
    /// `column <= value`
    Lte,
    /// `column IN (values...)`
    In,
}

/// Sort direction for an `order` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A single equality/comparison clause: `column op value(s)`.
#[derive(Debug, Clone)]
pub struct Clause {
    /// Column name; validated against [`is_valid_identifier`] before use.
    pub column: String,
    /// The operator to apply.
    pub op: FilterOp,
    /// The comparand(s) — a single value for everything but `In`.
    pub values: Vec<Value>,
}

/// An ordering term: `column.asc` / `column.desc`.
#[derive(Debug, Clone)]
pub struct OrderTerm {
    /// Column to sort by.
    pub column: String,
    /// Sort direction.
    pub direction: SortDirection,
}

/// The fixed filter language every gateway backend must support identically:
/// equality, inequality, set membership, ordering, and row limit.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Conjunctive list of clauses (all must hold).
    pub clauses: Vec<Clause>,
    /// Ordering terms, applied left to right.
    pub order: Vec<OrderTerm>,
    /// Maximum rows to return.
    pub limit: Option<usize>,
}

impl Filter {
    /// An unconstrained filter: every row, in storage order.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality clause and return `self` for chaining.
    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            op: FilterOp::Eq,
            values: vec![value.into()],
        });
        self
    }

    /// Add a `column IN (values)` clause.
    #[must_use]
    pub fn in_set(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            op: FilterOp::In,
            values,
        });
        self
    }

    /// Add a `column >= value` clause.
    #[must_use]
    pub fn gte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            op: FilterOp::Gte,
            values: vec![value.into()],
        });
        self
    }

    /// Add a `column <= value` clause.
    #[must_use]
    pub fn lte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            op: FilterOp::Lte,
            values: vec![value.into()],
        });
        self
    }

    /// Order ascending by `column`.
    #[must_use]
    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order.push(OrderTerm {
            column: column.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    /// Order descending by `column`.
    #[must_use]
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push(OrderTerm {
            column: column.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    /// Cap the number of returned rows.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Validate every identifier referenced by this filter against the
    /// column-name allowlist. The native backend calls this before any SQL
    /// text is assembled; the REST backend calls it before building a query
    /// string, so both backends reject the same malformed input.
    pub fn validate_identifiers(&self) -> Result<()> {
        for clause in &self.clauses {
            if !is_valid_identifier(&clause.column) {
                return Err(Error::ValidationFailed {
                    issues: vec![format!("invalid filter column: {}", clause.column)],
                });
            }
        }
        for term in &self.order {
            if !is_valid_identifier(&term.column) {
                return Err(Error::ValidationFailed {
                    issues: vec![format!("invalid order column: {}", term.column)],
                });
            }
        }
        Ok(())
    }

    /// Apply this filter to an in-memory set of JSON rows. Used directly by
    /// the native backend (which stores rows as JSON documents) and by tests
    /// asserting filter semantics are backend-agnostic.
    #[must_use]
    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        let mut filtered: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.clauses.iter().all(|c| clause_matches(c, row)))
            .collect();

        if !self.order.is_empty() {
            filtered.sort_by(|a, b| {
                for term in &self.order {
                    let av = a.get(&term.column).cloned().unwrap_or(Value::Null);
                    let bv = b.get(&term.column).cloned().unwrap_or(Value::Null);
                    let ord = compare_values(&av, &bv);
                    let ord = match term.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            filtered.truncate(limit);
        }
        filtered
    }
}

fn clause_matches(clause: &Clause, row: &Value) -> bool {
    let field = row.get(&clause.column).cloned().unwrap_or(Value::Null);
    match clause.op {
        FilterOp::Eq => clause.values.first().is_some_and(|v| values_eq(&field, v)),
        FilterOp::Gt => clause
            .values
            .first()
            .is_some_and(|v| compare_values(&field, v) == std::cmp::Ordering::Greater),
        FilterOp::Gte => clause.values.first().is_some_and(|v| {
            !matches!(
                compare_values(&field, v),
                std::cmp::Ordering::Less
            )
        }),
        FilterOp::Lte => clause.values.first().is_some_and(|v| {
            !matches!(
                compare_values(&field, v),
                std::cmp::Ordering::Greater
            )
        }),
        FilterOp::In => clause.values.iter().any(|v| values_eq(&field, v)),
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    a == b
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Identifier allowlist, checked before any column name is interpolated
/// into raw SQL: a leading letter or underscore, then letters, digits, or
/// underscores.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The narrow interface every other component addresses persistence
/// through: `rpc`, `query`, `insert`, `update`, `delete`.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Invoke a named atomic procedure with JSON parameters, returning its
    /// JSON result. Atomic procedures (`acquire_lock`, `claim_task`, ...)
    /// are the only way callers get linearised, multi-step persistence
    /// behavior; `query`/`insert`/`update`/`delete` are not atomic across
    /// calls.
    async fn rpc(&self, function: &str, params: Value) -> Result<Value>;

    /// Query `table` for rows matching `filter`.
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>>;

    /// Insert `row` into `table`, returning the stored row (with any
    /// server-assigned fields such as `id`/`created_at` populated).
    async fn insert(&self, table: &str, row: Value) -> Result<Value>;

    /// Patch every row in `table` matching `match_filter`, returning the
    /// updated rows.
    async fn update(&self, table: &str, match_filter: &Filter, patch: Value) -> Result<Vec<Value>>;

    /// Delete every row in `table` matching `match_filter`.
    async fn delete(&self, table: &str, match_filter: &Filter) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        vec![
            json!({"id": "a", "priority": 3, "created_at": "2026-01-01T00:00:00Z"}),
            json!({"id": "b", "priority": 1, "created_at": "2026-01-02T00:00:00Z"}),
            json!({"id": "c", "priority": 1, "created_at": "2026-01-01T00:00:00Z"}),
        ]
    }

    #[test]
    fn filter_orders_by_priority_then_created_at() {
        let filter = Filter::all().order_asc("priority").order_asc("created_at");
        let out = filter.apply(rows());
        let ids: Vec<&str> = out.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn filter_eq_and_limit() {
        let filter = Filter::all().eq("priority", 1).limit(1);
        let out = filter.apply(rows());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["priority"], 1);
    }

    #[test]
    fn rejects_invalid_identifiers() {
        let filter = Filter::all().eq("bad column; drop table x", 1);
        assert!(filter.validate_identifiers().is_err());
    }

    #[test]
    fn accepts_valid_identifiers() {
        let filter = Filter::all().eq("status", "pending");
        assert!(filter.validate_identifiers().is_ok());
    }
}
