//! HTTP transport between members.
//!
//! Operations are posted as bincode bodies to the internal endpoint of the
//! target member; its HTTP address comes from the gossip member list.

use super::membership::GossipMembership;
use super::transport::{Transport, decode_reply, encode_operation};
use super::types::NodeId;
use crate::config::InvocationConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::engine::ExecutorEngine;
use crate::executor::protocol::{ENDPOINT_INTERNAL_OPERATION, Operation, OperationResponse};

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::Extension;
use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

/// Connection-level retries for one operation. Ownership retries happen a
/// level up, in the invoker.
const SEND_ATTEMPTS: usize = 3;

pub struct HttpTransport {
    membership: Arc<GossipMembership>,
    http_client: reqwest::Client,
    settings: InvocationConfig,
}

impl HttpTransport {
    pub fn new(membership: Arc<GossipMembership>, settings: InvocationConfig) -> Self {
        Self {
            membership,
            http_client: reqwest::Client::new(),
            settings,
        }
    }

    async fn post_with_retry(
        &self,
        url: String,
        body: Vec<u8>,
        timeout: Option<Duration>,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = self.settings.backoff_base_ms;

        for attempt in 0..attempts {
            let mut request = self.http_client.post(url.clone()).body(body.clone());
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.settings.backoff_cap_ms);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, target: &NodeId, op: Operation) -> ExecutorResult<OperationResponse> {
        let node = self
            .membership
            .get_member(target)
            .ok_or_else(|| ExecutorError::MemberLeft(format!("unknown member {}", target)))?;

        let body = encode_operation(&op)?;
        // A retrieval may wait as long as the task runs.
        let timeout = (!op.waits_on_task()).then(|| self.settings.call_timeout());
        let url = format!("http://{}{}", node.http_addr, ENDPOINT_INTERNAL_OPERATION);

        let response = self
            .post_with_retry(url, body, timeout, SEND_ATTEMPTS)
            .await
            .map_err(|e| ExecutorError::Transport(format!("{} unreachable: {:#}", target, e)))?;

        if !response.status().is_success() {
            return Err(ExecutorError::Transport(format!(
                "{} answered {} to {}",
                target,
                response.status(),
                op.kind()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        decode_reply(&bytes)
    }
}

pub async fn handle_internal_operation(
    Extension(engine): Extension<Arc<ExecutorEngine>>,
    body: Bytes,
) -> Vec<u8> {
    engine.handle_bytes(&body).await
}

/// Routes served to other members.
pub fn internal_router(engine: Arc<ExecutorEngine>) -> Router {
    Router::new()
        .route(ENDPOINT_INTERNAL_OPERATION, post(handle_internal_operation))
        .layer(Extension(engine))
}
