use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde_json::Value;

use crate::{
    error::{Result, SerieslyError},
    store::DbInfo,
};

/// Options for a bucketed query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub from: Option<String>,
    pub to: Option<String>,
    pub group_ms: u64,
    pub pointers: Vec<String>,
    pub reducers: Vec<String>,
    pub filters: Vec<(String, String)>,
}

/// Thin client for a remote seriesly server.
pub struct SerieslyClient {
    base: String,
    http: reqwest::Client,
}

impl SerieslyClient {
    pub fn new(base: impl Into<String>) -> SerieslyClient {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        SerieslyClient {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    async fn expect_ok(res: reqwest::Response) -> Result<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SerieslyError::NotFound);
        }
        let reason = res.text().await.unwrap_or_default();
        Err(SerieslyError::Internal(format!("{status}: {reason}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let res = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res)
            .await?
            .json()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))
    }

    pub async fn server_info(&self) -> Result<Value> {
        self.get_json("").await
    }

    pub async fn list_dbs(&self) -> Result<Vec<String>> {
        self.get_json("_all_dbs").await
    }

    pub async fn create_db(&self, name: &str) -> Result<()> {
        let res = self
            .http
            .put(self.url(name))
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res).await.map(|_| ())
    }

    pub async fn delete_db(&self, name: &str) -> Result<()> {
        let res = self
            .http
            .delete(self.url(name))
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res).await.map(|_| ())
    }

    pub async fn db_info(&self, name: &str) -> Result<DbInfo> {
        self.get_json(name).await
    }

    /// Stores a document under `ts` (any accepted timestamp format), or
    /// under the server's current time when absent.
    pub async fn store(&self, dbname: &str, ts: Option<&str>, body: &Value) -> Result<()> {
        let mut req = self.http.post(self.url(dbname));
        if let Some(ts) = ts {
            req = req.query(&[("ts", ts)]);
        }
        let res = req
            .json(body)
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res).await.map(|_| ())
    }

    /// Stores raw bytes under an explicit key.
    pub async fn store_at(&self, dbname: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let res = self
            .http
            .put(self.url(&format!("{dbname}/{key}")))
            .body(body)
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res).await.map(|_| ())
    }

    pub async fn get(&self, dbname: &str, key: &str) -> Result<Value> {
        self.get_json(&format!("{dbname}/{key}")).await
    }

    pub async fn compact(&self, dbname: &str) -> Result<()> {
        let res = self
            .http
            .post(self.url(&format!("{dbname}/_compact")))
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res).await.map(|_| ())
    }

    /// Runs a bucketed query, returning results keyed by bucket-start
    /// milliseconds.
    pub async fn query(&self, dbname: &str, opts: &QueryOptions) -> Result<BTreeMap<String, Value>> {
        let mut params: Vec<(&str, String)> = vec![("group", opts.group_ms.to_string())];
        if let Some(from) = &opts.from {
            params.push(("from", from.clone()));
        }
        if let Some(to) = &opts.to {
            params.push(("to", to.clone()));
        }
        for ptr in &opts.pointers {
            params.push(("ptr", ptr.clone()));
        }
        for red in &opts.reducers {
            params.push(("reducer", red.clone()));
        }
        for (f, fv) in &opts.filters {
            params.push(("f", f.clone()));
            params.push(("fv", fv.clone()));
        }

        let res = self
            .http
            .get(self.url(&format!("{dbname}/_query")))
            .query(&params)
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res)
            .await?
            .json()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))
    }

    /// Fetches the dump stream (newline-delimited `{"key": doc}` objects).
    pub async fn dump(&self, dbname: &str, from: Option<&str>, to: Option<&str>) -> Result<String> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(from) = from {
            params.push(("from", from));
        }
        if let Some(to) = to {
            params.push(("to", to));
        }
        let res = self
            .http
            .get(self.url(&format!("{dbname}/_dump")))
            .query(&params)
            .send()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))?;
        Self::expect_ok(res)
            .await?
            .text()
            .await
            .map_err(|err| SerieslyError::Internal(err.to_string()))
    }
}
