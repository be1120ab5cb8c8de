use super::protocol::*;
use super::types::*;
use crate::error::ExecutorError;
use crate::node::ClusterNode;

use axum::{
    Extension, Json,
    extract::{Path, Query},
    http::StatusCode,
};
use std::time::Duration;

const DEFAULT_RESULT_WAIT_MS: u64 = 30_000;

fn status_for(error: &ExecutorError) -> StatusCode {
    match error {
        ExecutorError::InvalidArgument(_) | ExecutorError::Codec(_) => StatusCode::BAD_REQUEST,
        ExecutorError::StaleTaskId(_) => StatusCode::GONE,
        ExecutorError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ExecutorError::Rejected(_)
        | ExecutorError::NotOwner { .. }
        | ExecutorError::MemberLeft(_)
        | ExecutorError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExecutorError::Execution { .. } | ExecutorError::Cancelled => StatusCode::OK,
    }
}

pub async fn handle_submit(
    Extension(node): Extension<ClusterNode>,
    Path(name): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> (StatusCode, Json<SubmitResponse>) {
    let failure = |error: ExecutorError| {
        tracing::error!("Failed to submit {} to '{}': {}", req.task_type, name, error);
        (
            status_for(&error),
            Json(SubmitResponse {
                task_id: None,
                error: Some(error.to_string()),
            }),
        )
    };

    let envelope = match req.task.clone() {
        None => None,
        Some(task) => match node.registry().envelope_from_json(&req.task_type, task) {
            Ok(envelope) => Some(envelope),
            Err(e) => return failure(ExecutorError::InvalidArgument(format!("{:#}", e))),
        },
    };

    let executor = node.durable_executor(&name);
    let future = match executor.submit_envelope(envelope, req.key.as_deref()).await {
        Ok(future) => future,
        Err(e) => return failure(e),
    };

    match future.task_id() {
        Some(task_id) => {
            tracing::info!("Task {} submitted to '{}'", task_id, name);
            (
                StatusCode::OK,
                Json(SubmitResponse {
                    task_id: Some(task_id),
                    error: None,
                }),
            )
        }
        None => {
            let error = match future.get().await {
                Err(e) => e,
                Ok(_) => ExecutorError::Transport("submission produced no task id".to_string()),
            };
            failure(error)
        }
    }
}

pub async fn handle_result(
    Extension(node): Extension<ClusterNode>,
    Path((name, partition, sequence)): Path<(String, u32, u64)>,
    Query(query): Query<ResultQuery>,
) -> (StatusCode, Json<ResultResponse>) {
    let task_id = TaskId::new(partition, sequence);
    let executor = node.durable_executor(&name);
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(DEFAULT_RESULT_WAIT_MS));

    let reply = |status: StatusCode, result: ResultStatus, value, error| {
        (
            status,
            Json(ResultResponse {
                task_id,
                status: result,
                value,
                error,
            }),
        )
    };

    let future = executor.retrieve_encoded_result(task_id, query.dispose);
    match future.get_timeout(wait).await {
        Ok(Some(bytes)) => {
            let value = match &query.task_type {
                Some(task_type) => match node.registry().output_to_json(task_type, &bytes) {
                    Ok(value) => value,
                    Err(e) => {
                        return reply(
                            StatusCode::BAD_REQUEST,
                            ResultStatus::Error,
                            None,
                            Some(format!("{:#}", e)),
                        );
                    }
                },
                None => serde_json::json!(bytes),
            };
            reply(StatusCode::OK, ResultStatus::Completed, Some(value), None)
        }
        Ok(None) => reply(StatusCode::OK, ResultStatus::Empty, None, None),
        Err(ExecutorError::Execution { cause }) => {
            reply(StatusCode::OK, ResultStatus::Failed, None, Some(cause))
        }
        Err(ExecutorError::Cancelled) => reply(StatusCode::OK, ResultStatus::Cancelled, None, None),
        Err(error @ ExecutorError::StaleTaskId(_)) => {
            reply(StatusCode::GONE, ResultStatus::Stale, None, Some(error.to_string()))
        }
        Err(ExecutorError::Timeout) => reply(StatusCode::ACCEPTED, ResultStatus::Pending, None, None),
        Err(error) => {
            tracing::warn!("Failed to retrieve {} from '{}': {}", task_id, name, error);
            reply(status_for(&error), ResultStatus::Error, None, Some(error.to_string()))
        }
    }
}

pub async fn handle_shutdown(
    Extension(node): Extension<ClusterNode>,
    Path(name): Path<String>,
    Query(query): Query<ShutdownQuery>,
) -> (StatusCode, Json<ShutdownResponse>) {
    let executor = node.durable_executor(&name);
    let drained = if query.now {
        executor.shutdown_now().await
    } else {
        executor.shutdown().await;
        Vec::new()
    };

    (
        StatusCode::OK,
        Json(ShutdownResponse {
            drained,
            is_shutdown: executor.is_shutdown(),
            is_terminated: executor.is_terminated(),
        }),
    )
}

pub async fn handle_stats(
    Extension(node): Extension<ClusterNode>,
    Path(name): Path<String>,
) -> Json<StatsResponse> {
    let executor = node.durable_executor(&name);
    Json(StatsResponse {
        stats: executor.local_stats(),
        is_shutdown: executor.is_shutdown(),
        is_terminated: executor.is_terminated(),
        name,
    })
}
