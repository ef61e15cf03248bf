// src/datastore.rs
//
// =============================================================================
// XTB-FORGE: DATASTORE CLIENT (v 0.1)
// =============================================================================
//
// A thin, typed HTTP client over a PostgREST-style interface: filters are
// `?column=eq.value` query params, writes carry `Prefer: return=representation`
// so inserts/updates hand back the row as the server assigned it (e.g. the
// DataStore-issued `id`). All calls carry the `apikey`/`Authorization`
// headers; all calls may fail with transport or auth errors, returned
// structurally — this client never panics or throws into business logic.
//
// Failures from Logging Emitter calls are logged and swallowed by the
// caller (see emitter.rs); this client only reports them.

use crate::config::DataStoreConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("datastore returned {status}: {body}")]
    Api { status: u16, body: String },
}

pub type DataStoreResult<T> = std::result::Result<T, DataStoreError>;

/// Equality filter: `column=eq.value`. PostgREST supports richer operators
/// (`gt.`, `lt.`, `in.`, ...); this crate only needs equality and ordering.
#[derive(Debug, Clone)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl std::fmt::Display) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub select: Option<String>,
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Clone)]
pub struct DataStoreClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DataStoreClient {
    pub fn new(cfg: &DataStoreConfig) -> DataStoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            api_key: cfg.key.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn apply_query(&self, req: reqwest::RequestBuilder, query: &Query) -> reqwest::RequestBuilder {
        let mut req = req;
        for filter in &query.filters {
            req = req.query(&[(filter.column.as_str(), format!("eq.{}", filter.value))]);
        }
        if let Some(select) = &query.select {
            req = req.query(&[("select", select.as_str())]);
        }
        if let Some(order) = &query.order {
            req = req.query(&[("order", order.as_str())]);
        }
        if let Some(limit) = query.limit {
            req = req.query(&[("limit", limit.to_string())]);
        }
        if let Some(offset) = query.offset {
            req = req.query(&[("offset", offset.to_string())]);
        }
        req
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    pub async fn get<T: DeserializeOwned>(&self, table: &str, query: &Query) -> DataStoreResult<Vec<T>> {
        let req = self.http.get(self.table_url(table));
        let req = self.apply_query(req, query);
        let req = self.auth(req);
        let resp = req.send().await?;
        Self::handle(resp).await
    }

    pub async fn insert<R: Serialize, T: DeserializeOwned>(&self, table: &str, row: &R) -> DataStoreResult<T> {
        let req = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(row);
        let req = self.auth(req);
        let resp = req.send().await?;
        let mut rows: Vec<T> = Self::handle(resp).await?;
        rows.pop().ok_or_else(|| DataStoreError::Api {
            status: 0,
            body: "insert returned no rows".to_string(),
        })
    }

    pub async fn insert_many<R: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        rows: &[R],
    ) -> DataStoreResult<Vec<T>> {
        let req = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(rows);
        let req = self.auth(req);
        let resp = req.send().await?;
        Self::handle(resp).await
    }

    pub async fn update<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query,
        patch: &Value,
    ) -> DataStoreResult<Vec<T>> {
        let req = self
            .http
            .patch(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(patch);
        let req = self.apply_query(req, query);
        let req = self.auth(req);
        let resp = req.send().await?;
        Self::handle(resp).await
    }

    pub async fn delete(&self, table: &str, query: &Query) -> DataStoreResult<u64> {
        let req = self
            .http
            .delete(self.table_url(table))
            .header("Prefer", "return=representation");
        let req = self.apply_query(req, query);
        let req = self.auth(req);
        let resp = req.send().await?;
        let rows: Vec<Value> = Self::handle(resp).await?;
        Ok(rows.len() as u64)
    }

    async fn handle<T: DeserializeOwned>(resp: reqwest::Response) -> DataStoreResult<T> {
        let status = resp.status();
        if status.is_success() {
            resp.json().await.map_err(DataStoreError::Request)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(DataStoreError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}
