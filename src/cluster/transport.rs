use super::types::NodeId;
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::protocol::{Operation, OperationResponse};

use async_trait::async_trait;

/// Delivers an executor operation to a member and returns its reply.
///
/// Implementations move the operation as encoded bytes; the task payload
/// inside is already encoded and is carried verbatim.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, target: &NodeId, op: Operation) -> ExecutorResult<OperationResponse>;
}

pub fn encode_operation(op: &Operation) -> ExecutorResult<Vec<u8>> {
    Ok(bincode::serialize(op)?)
}

pub fn decode_operation(bytes: &[u8]) -> ExecutorResult<Operation> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_reply(reply: &ExecutorResult<OperationResponse>) -> Vec<u8> {
    bincode::serialize(reply).unwrap_or_else(|e| {
        tracing::error!("Failed to encode operation reply: {}", e);
        // An encoded `Err(Codec)` is always representable.
        bincode::serialize(&ExecutorResult::<OperationResponse>::Err(ExecutorError::Codec(
            e.to_string(),
        )))
        .unwrap_or_default()
    })
}

pub fn decode_reply(bytes: &[u8]) -> ExecutorResult<OperationResponse> {
    bincode::deserialize::<ExecutorResult<OperationResponse>>(bytes)?
}
