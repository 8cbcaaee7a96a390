//! HTTP client for the rendezvous service

use gangrun_core::{GangrunError, GangrunResult, SlotInfo};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Client workers use to reach the rendezvous server
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    client: reqwest::Client,
    base_url: String,
}

fn request_error(e: reqwest::Error) -> GangrunError {
    GangrunError::Rendezvous(e.to_string())
}

impl RendezvousClient {
    /// Client for the server at `addr:port`
    pub fn new(addr: &str, port: u16, timeout: Duration) -> GangrunResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(request_error)?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", addr, port),
        })
    }

    /// Whether the server answers its health check
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Rendezvous health check failed");
                false
            }
        }
    }

    /// Whole allocation plan
    pub async fn slots(&self) -> GangrunResult<Vec<SlotInfo>> {
        let response = self
            .client
            .get(format!("{}/slots", self.base_url))
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?;
        response.json().await.map_err(request_error)
    }

    /// Slot of the worker at `local_rank` on `host`
    pub async fn slot(&self, host: &str, local_rank: u32) -> GangrunResult<SlotInfo> {
        let response = self
            .client
            .get(format!("{}/slots/{}/{}", self.base_url, host, local_rank))
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GangrunError::Rendezvous(format!(
                "No slot for {} local rank {}",
                host, local_rank
            )));
        }
        response
            .error_for_status()
            .map_err(request_error)?
            .json()
            .await
            .map_err(request_error)
    }

    /// Store `value` under `scope/key`
    pub async fn put(&self, scope: &str, key: &str, value: Vec<u8>) -> GangrunResult<()> {
        self.client
            .put(self.key_url(scope, key))
            .body(value)
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?;
        Ok(())
    }

    /// Value under `scope/key`, if present
    pub async fn get(&self, scope: &str, key: &str) -> GangrunResult<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.key_url(scope, key))
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .map_err(request_error)?
            .bytes()
            .await
            .map_err(request_error)?;
        Ok(Some(bytes.to_vec()))
    }

    /// Remove `scope/key`; returns whether it existed
    pub async fn delete(&self, scope: &str, key: &str) -> GangrunResult<bool> {
        let response = self
            .client
            .delete(self.key_url(scope, key))
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status().map_err(request_error)?;
        Ok(true)
    }

    fn key_url(&self, scope: &str, key: &str) -> String {
        format!("{}/kv/{}/{}", self.base_url, scope, key)
    }
}
