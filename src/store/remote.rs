use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::store::{CasOutcome, KvEntry, MemoryStore, Store};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StoreRequest {
    Get {
        key: String,
    },
    List {
        prefix: String,
    },
    Put {
        key: String,
        value: String,
    },
    Cas {
        key: String,
        expected: Option<u64>,
        value: String,
        ttl_ms: Option<u64>,
    },
    Refresh {
        key: String,
        version: u64,
        ttl_ms: u64,
    },
    Delete {
        key: String,
    },
    CompareAndDelete {
        key: String,
        version: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum StoreResponse {
    Entry { entry: Option<KvEntry> },
    Entries { entries: Vec<KvEntry> },
    Version { version: u64 },
    Cas { outcome: CasOutcome },
    Applied { applied: bool },
}

/// Client for a [`MemoryStore`] served by another node.
///
/// Linearizability comes from the serving node; this side only forwards.
/// Every transport or protocol failure is reported as `StoreUnavailable`.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CadenceError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/store", base_url.trim_end_matches('/')),
        })
    }

    async fn call(&self, request: StoreRequest) -> Result<StoreResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CadenceError::StoreUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CadenceError::StoreUnavailable(format!("{}: {}", status, body)));
        }

        response
            .json::<StoreResponse>()
            .await
            .map_err(|e| CadenceError::StoreUnavailable(format!("invalid store response: {}", e)))
    }
}

fn unexpected() -> CadenceError {
    CadenceError::StoreUnavailable("unexpected store response".to_string())
}

#[async_trait]
impl Store for RemoteStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        match self.call(StoreRequest::Get { key: key.to_string() }).await? {
            StoreResponse::Entry { entry } => Ok(entry),
            _ => Err(unexpected()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        match self
            .call(StoreRequest::List {
                prefix: prefix.to_string(),
            })
            .await?
        {
            StoreResponse::Entries { entries } => Ok(entries),
            _ => Err(unexpected()),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<u64> {
        match self
            .call(StoreRequest::Put {
                key: key.to_string(),
                value,
            })
            .await?
        {
            StoreResponse::Version { version } => Ok(version),
            _ => Err(unexpected()),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome> {
        match self
            .call(StoreRequest::Cas {
                key: key.to_string(),
                expected,
                value,
                ttl_ms: ttl.map(|t| t.as_millis() as u64),
            })
            .await?
        {
            StoreResponse::Cas { outcome } => Ok(outcome),
            _ => Err(unexpected()),
        }
    }

    async fn refresh(&self, key: &str, version: u64, ttl: Duration) -> Result<bool> {
        match self
            .call(StoreRequest::Refresh {
                key: key.to_string(),
                version,
                ttl_ms: ttl.as_millis() as u64,
            })
            .await?
        {
            StoreResponse::Applied { applied } => Ok(applied),
            _ => Err(unexpected()),
        }
    }

    async fn delete(&self, key: &str) -> Result<Option<KvEntry>> {
        match self
            .call(StoreRequest::Delete {
                key: key.to_string(),
            })
            .await?
        {
            StoreResponse::Entry { entry } => Ok(entry),
            _ => Err(unexpected()),
        }
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> Result<bool> {
        match self
            .call(StoreRequest::CompareAndDelete {
                key: key.to_string(),
                version,
            })
            .await?
        {
            StoreResponse::Applied { applied } => Ok(applied),
            _ => Err(unexpected()),
        }
    }
}

/// Serve `store` to peers at `POST /store`.
pub fn store_router(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route("/store", post(store_handler))
        .with_state(store)
}

async fn store_handler(
    State(store): State<Arc<MemoryStore>>,
    Json(request): Json<StoreRequest>,
) -> impl IntoResponse {
    let result = match request {
        StoreRequest::Get { key } => store
            .get(&key)
            .await
            .map(|entry| StoreResponse::Entry { entry }),
        StoreRequest::List { prefix } => store
            .list(&prefix)
            .await
            .map(|entries| StoreResponse::Entries { entries }),
        StoreRequest::Put { key, value } => store
            .put(&key, value)
            .await
            .map(|version| StoreResponse::Version { version }),
        StoreRequest::Cas {
            key,
            expected,
            value,
            ttl_ms,
        } => store
            .compare_and_swap(&key, expected, value, ttl_ms.map(Duration::from_millis))
            .await
            .map(|outcome| StoreResponse::Cas { outcome }),
        StoreRequest::Refresh {
            key,
            version,
            ttl_ms,
        } => store
            .refresh(&key, version, Duration::from_millis(ttl_ms))
            .await
            .map(|applied| StoreResponse::Applied { applied }),
        StoreRequest::Delete { key } => store
            .delete(&key)
            .await
            .map(|entry| StoreResponse::Entry { entry }),
        StoreRequest::CompareAndDelete { key, version } => store
            .compare_and_delete(&key, version)
            .await
            .map(|applied| StoreResponse::Applied { applied }),
    };

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Store request failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}
