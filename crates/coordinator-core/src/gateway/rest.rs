//! The REST-over-HTTP persistence backend: a thin `reqwest` client against a
//! PostgREST-shaped API. Builds query strings from the fixed filter DSL
//! (`column=eq.value`, `column=gt.value`, `column=in.(a,b,c)`,
//! `order=col.asc,col2.desc`, `limit=N`), sends `rpc()` as
//! `POST {prefix}/rpc/{function}` with a JSON body, and `insert`/`update`
//! with `Prefer: return=representation` so the mutated rows come back in the
//! response rather than requiring a second round trip.

use super::{Filter, FilterOp, PersistenceGateway, SortDirection};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;

/// REST-backed [`PersistenceGateway`].
#[derive(Debug, Clone)]
pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    prefix: String,
}

impl RestGateway {
    /// Build a gateway addressing `base_url` (e.g.
    /// `https://coordinator.internal`) under the given REST path prefix
    /// (e.g. `/rest/v1`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            prefix: prefix.into(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}{}/{}", self.base_url, self.prefix, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}{}/rpc/{}", self.base_url, self.prefix, function)
    }

    fn query_params(filter: &Filter) -> Vec<(String, String)> {
        let mut params = Vec::new();
        for clause in &filter.clauses {
            let op = match clause.op {
                FilterOp::Eq => "eq",
                FilterOp::Gt => "gt",
                FilterOp::Gte => "gte",
                FilterOp::Lte => "lte",
                FilterOp::In => "in",
            };
            let rendered = if clause.op == FilterOp::In {
                let joined = clause
                    .values
                    .iter()
                    .map(render_scalar)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{op}.({joined})")
            } else {
                let v = clause.values.first().map(render_scalar).unwrap_or_default();
                format!("{op}.{v}")
            };
            params.push((clause.column.clone(), rendered));
        }
        if !filter.order.is_empty() {
            let order = filter
                .order
                .iter()
                .map(|term| {
                    let dir = match term.direction {
                        SortDirection::Asc => "asc",
                        SortDirection::Desc => "desc",
                    };
                    format!("{}.{dir}", term.column)
                })
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".into(), order));
        }
        if let Some(limit) = filter.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params
    }
}

fn render_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl PersistenceGateway for RestGateway {
    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.rpc_url(function))
            .json(&params)
            .send()
            .await
            .map_err(Error::from)?;
        if !resp.status().is_success() {
            return Err(Error::backend_unavailable(format!(
                "rpc {function} returned {}",
                resp.status()
            )));
        }
        resp.json::<Value>().await.map_err(Error::from)
    }

    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        filter.validate_identifiers()?;
        let resp = self
            .client
            .get(self.table_url(table))
            .query(&Self::query_params(filter))
            .send()
            .await
            .map_err(Error::from)?;
        if !resp.status().is_success() {
            return Err(Error::backend_unavailable(format!(
                "query {table} returned {}",
                resp.status()
            )));
        }
        resp.json::<Vec<Value>>().await.map_err(Error::from)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(Error::from)?;
        if !resp.status().is_success() {
            return Err(Error::backend_unavailable(format!(
                "insert {table} returned {}",
                resp.status()
            )));
        }
        let mut rows: Vec<Value> = resp.json().await.map_err(Error::from)?;
        rows.pop().ok_or_else(|| {
            Error::backend_unavailable(format!("insert {table} returned no rows"))
        })
    }

    async fn update(&self, table: &str, match_filter: &Filter, patch: Value) -> Result<Vec<Value>> {
        match_filter.validate_identifiers()?;
        let resp = self
            .client
            .patch(self.table_url(table))
            .query(&Self::query_params(match_filter))
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await
            .map_err(Error::from)?;
        if !resp.status().is_success() {
            return Err(Error::backend_unavailable(format!(
                "update {table} returned {}",
                resp.status()
            )));
        }
        resp.json::<Vec<Value>>().await.map_err(Error::from)
    }

    async fn delete(&self, table: &str, match_filter: &Filter) -> Result<()> {
        match_filter.validate_identifiers()?;
        let resp = self
            .client
            .delete(self.table_url(table))
            .query(&Self::query_params(match_filter))
            .send()
            .await
            .map_err(Error::from)?;
        if !resp.status().is_success() {
            return Err(Error::backend_unavailable(format!(
                "delete {table} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_params_render_fixed_dsl() {
        let filter = Filter::all()
            .eq("status", "pending")
            .in_set("priority", vec![json!(1), json!(2)])
            .order_asc("priority")
            .limit(10);
        let params = RestGateway::query_params(&filter);
        assert!(params.contains(&("status".to_string(), "eq.pending".to_string())));
        assert!(params.contains(&("priority".to_string(), "in.(1,2)".to_string())));
        assert!(params.contains(&("order".to_string(), "priority.asc".to_string())));
        assert!(params.contains(&("limit".to_string(), "10".to_string())));
    }
}
