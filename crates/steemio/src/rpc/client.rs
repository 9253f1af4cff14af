//! Plain JSON-RPC-over-HTTP client for one upstream endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::errors::ClientError;
use crate::rpc::traits::SteemClient;
use crate::rpc::types::{DynamicGlobalProps, SteemBlock};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct HttpSteemClient {
    url: String,
    http: reqwest::Client,
}

impl HttpSteemClient {
    pub fn new(url: String) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { url, http })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, ClientError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let resp: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.get("error") {
            return Err(ClientError::Rpc(err.to_string()));
        }
        match resp.get("result") {
            None | Some(Value::Null) => Ok(None),
            Some(result) => Ok(Some(serde_json::from_value(result.clone())?)),
        }
    }
}

#[async_trait]
impl SteemClient for HttpSteemClient {
    async fn get_dynamic_global_properties(&self) -> Result<DynamicGlobalProps, ClientError> {
        self.call("condenser_api.get_dynamic_global_properties", json!([]))
            .await?
            .ok_or(ClientError::EmptyResponse)
    }

    async fn get_block(&self, height: u64) -> Result<Option<SteemBlock>, ClientError> {
        self.call("condenser_api.get_block", json!([height])).await
    }
}
