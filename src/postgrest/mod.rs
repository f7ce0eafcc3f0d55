//! Table operations through the PostgREST API

mod types;

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::fetch::{Fetch, FetchBuilder};

pub use types::*;

/// Client for one table
///
/// Filters and modifiers are accumulated by value and applied when one of
/// the executing methods is awaited.
#[derive(Clone)]
pub struct PostgrestClient {
    base_url: String,
    api_key: String,
    table: String,
    http_client: Client,
    token: Option<String>,
    timeout: Option<Duration>,
    query_params: Vec<(String, String)>,
}

impl PostgrestClient {
    /// Create a new PostgrestClient
    pub fn new(base_url: &str, api_key: &str, table: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            table: table.to_string(),
            http_client,
            token: None,
            timeout: None,
            query_params: Vec::new(),
        }
    }

    /// Authenticate requests as the signed-in user
    pub fn with_auth(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Bound every request made by this client
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Columns to return
    pub fn select(mut self, columns: &str) -> Self {
        self.set_param("select", columns);
        self
    }

    /// Filter rows where column equals a value
    pub fn eq<T: ToString>(mut self, column: &str, value: T) -> Self {
        self.query_params
            .push((column.to_string(), format!("eq.{}", value.to_string())));
        self
    }

    /// Order the results by a column
    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        self.set_param("order", &format!("{}.{}", column, order.as_str()));
        self
    }

    /// Limit the number of rows returned
    pub fn limit(mut self, count: u32) -> Self {
        self.set_param("limit", &count.to_string());
        self
    }

    fn set_param(&mut self, key: &str, value: &str) {
        self.query_params.retain(|(k, _)| k != key);
        self.query_params.push((key.to_string(), value.to_string()));
    }

    fn url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn prepare<'a>(&'a self, builder: FetchBuilder<'a>) -> FetchBuilder<'a> {
        let mut builder = builder
            .apikey(&self.api_key)
            .bearer_auth(self.token.as_deref().unwrap_or(&self.api_key))
            .query_pairs(&self.query_params)
            .classify(database_error);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// Fetch the matching rows
    pub async fn execute<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let url = self.url();
        self.prepare(Fetch::get(&self.http_client, &url))
            .execute::<Vec<T>>()
            .await
    }

    /// Fetch at most one matching row
    pub async fn maybe_single<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let rows = self.clone().limit(1).execute::<T>().await?;
        Ok(rows.into_iter().next())
    }

    /// Insert rows and return them as stored
    pub async fn insert<V: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        values: &V,
    ) -> Result<Vec<T>> {
        let url = self.url();
        self.prepare(Fetch::post(&self.http_client, &url))
            .header("Prefer", "return=representation")
            .json(values)?
            .execute::<Vec<T>>()
            .await
    }

    /// Insert rows, merging into existing ones that collide on `on_conflict`
    pub async fn upsert<V: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        values: &V,
        on_conflict: &str,
    ) -> Result<Vec<T>> {
        let url = self.url();
        self.prepare(Fetch::post(&self.http_client, &url))
            .query("on_conflict", on_conflict)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(values)?
            .execute::<Vec<T>>()
            .await
    }

    /// Update the matching rows and return them
    pub async fn update<V: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        values: &V,
    ) -> Result<Vec<T>> {
        let url = self.url();
        self.prepare(Fetch::patch(&self.http_client, &url))
            .header("Prefer", "return=representation")
            .json(values)?
            .execute::<Vec<T>>()
            .await
    }

    /// Delete the matching rows
    pub async fn delete(&self) -> Result<()> {
        let url = self.url();
        self.prepare(Fetch::delete(&self.http_client, &url))
            .header("Prefer", "return=minimal")
            .execute_empty()
            .await
    }
}
