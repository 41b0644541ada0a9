//! Forwarding client mutations to the application's push endpoint.
//!
//! Mutations arrive in per-client batches, are POSTed to the configured
//! endpoint, and the per-mutation results are demuxed back. Recoverable
//! failures (app errors, transient HTTP/network trouble) stay attached
//! to their mutation result; out-of-order mutations and unsupported
//! push/schema versions fail the whole connection with `InvalidPush`,
//! and a 401 bubbles up as `AuthInvalidated`.

use std::{collections::BTreeMap, sync::Arc};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;
use zero_core::protocol::{
    ClientId, MutationOutcome, MutationResult, PushBody, PushResponse,
};

#[derive(Error, Debug, Clone)]
pub enum PushError {
    #[error("invalid push: {0}")]
    InvalidPush(String),
    #[error("push authentication invalidated: {0}")]
    AuthInvalidated(String),
    #[error("pusher pool closed")]
    PoolClosed,
}

#[derive(Debug, Clone)]
pub struct PusherConfig {
    pub endpoint: Url,
    pub api_key: Option<String>,
    /// Number of concurrent workers forwarding batches.
    pub workers: usize,
}

/// A demuxed push: the response for the client plus the
/// `lastMutationID` advances the view-syncer should apply.
#[derive(Debug, Clone, PartialEq)]
pub struct PushResult {
    pub response: PushResponse,
    pub lmid_advances: Vec<(ClientId, u64)>,
}

/// Matches endpoint results to the batch that was sent, classifying
/// outcomes. Fatal kinds reject the whole push.
pub fn demux(batch: &PushBody, results: Vec<MutationResult>) -> Result<PushResult, PushError> {
    let mut by_key: BTreeMap<(ClientId, u64), MutationOutcome> = results
        .into_iter()
        .map(|r| ((r.client_id, r.id), r.result))
        .collect();

    let mut mutations = Vec::with_capacity(batch.mutations.len());
    let mut lmids: BTreeMap<ClientId, u64> = BTreeMap::new();
    for mutation in &batch.mutations {
        let key = (mutation.client_id.clone(), mutation.id);
        let outcome = by_key
            .remove(&key)
            .unwrap_or(MutationOutcome::Network {
                details: "endpoint returned no result for mutation".to_string(),
            });
        match &outcome {
            MutationOutcome::Ooo => {
                return Err(PushError::InvalidPush(format!(
                    "mutation {} of client {} is out of order",
                    mutation.id, mutation.client_id
                )))
            }
            MutationOutcome::UnsupportedPushVersion => {
                return Err(PushError::InvalidPush("unsupported push version".to_string()))
            }
            MutationOutcome::UnsupportedSchemaVersion => {
                return Err(PushError::InvalidPush("unsupported schema version".to_string()))
            }
            MutationOutcome::Auth { details } => {
                return Err(PushError::AuthInvalidated(details.clone()))
            }
            // A consumed mutation advances lastMutationID even when the
            // application rejected it.
            MutationOutcome::Ok | MutationOutcome::AppError { .. } => {
                let lmid = lmids.entry(mutation.client_id.clone()).or_insert(0);
                *lmid = (*lmid).max(mutation.id);
            }
            MutationOutcome::Http { .. } | MutationOutcome::Network { .. } => {}
        }
        mutations.push(MutationResult {
            id: mutation.id,
            client_id: mutation.client_id.clone(),
            result: outcome,
        });
    }

    Ok(PushResult {
        response: PushResponse { mutations },
        lmid_advances: lmids.into_iter().collect(),
    })
}

struct PushJob {
    body: PushBody,
    reply: oneshot::Sender<Result<PushResult, PushError>>,
}

/// A pool of workers forwarding push batches concurrently.
#[derive(Clone)]
pub struct PusherPool {
    queue: mpsc::Sender<PushJob>,
}

impl PusherPool {
    pub fn spawn(config: PusherConfig) -> Self {
        let (queue, receiver) = mpsc::channel::<PushJob>(256);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let client = reqwest::Client::new();
        for worker in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    let Some(job) = job else { break };
                    let result = forward(&client, &config, &job.body).await;
                    let _ = job.reply.send(result);
                }
                debug!(worker, "pusher worker done");
            });
        }
        PusherPool { queue }
    }

    pub async fn push(&self, body: PushBody) -> Result<PushResult, PushError> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(PushJob { body, reply })
            .await
            .map_err(|_| PushError::PoolClosed)?;
        response.await.map_err(|_| PushError::PoolClosed)?
    }
}

async fn forward(
    client: &reqwest::Client,
    config: &PusherConfig,
    body: &PushBody,
) -> Result<PushResult, PushError> {
    let mut request = client.post(config.endpoint.clone()).json(body);
    if let Some(api_key) = &config.api_key {
        request = request.header("X-Api-Key", api_key);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "push endpoint unreachable");
            return all_with(body, |details| MutationOutcome::Network { details }, err.to_string());
        }
    };

    match response.status() {
        StatusCode::OK => {
            let results: PushResponse = response
                .json()
                .await
                .map_err(|err| PushError::InvalidPush(format!("malformed push response: {err}")))?;
            demux(body, results.mutations)
        }
        StatusCode::UNAUTHORIZED => {
            Err(PushError::AuthInvalidated("push endpoint returned 401".to_string()))
        }
        status => {
            warn!(%status, "push endpoint error");
            all_with(
                body,
                move |details| MutationOutcome::Http { status: status.as_u16(), details },
                format!("push endpoint returned {status}"),
            )
        }
    }
}

/// Attaches the same recoverable outcome to every mutation in the batch.
fn all_with(
    body: &PushBody,
    outcome: impl Fn(String) -> MutationOutcome,
    details: String,
) -> Result<PushResult, PushError> {
    Ok(PushResult {
        response: PushResponse {
            mutations: body
                .mutations
                .iter()
                .map(|m| MutationResult {
                    id: m.id,
                    client_id: m.client_id.clone(),
                    result: outcome(details.clone()),
                })
                .collect(),
        },
        lmid_advances: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zero_core::protocol::Mutation;

    use super::*;

    fn batch(ids: &[(&str, u64)]) -> PushBody {
        PushBody {
            client_group_id: "g1".to_string(),
            mutations: ids
                .iter()
                .map(|(client, id)| Mutation {
                    id: *id,
                    client_id: client.to_string(),
                    name: "createIssue".to_string(),
                    args: json!({}),
                })
                .collect(),
            push_version: 1,
            schema_version: Some("6".to_string()),
        }
    }

    fn ok(client: &str, id: u64) -> MutationResult {
        MutationResult { id, client_id: client.to_string(), result: MutationOutcome::Ok }
    }

    #[test]
    fn successful_push_advances_last_mutation_ids() {
        let body = batch(&[("c1", 4), ("c1", 5), ("c2", 9)]);
        let result = demux(&body, vec![ok("c1", 4), ok("c1", 5), ok("c2", 9)]).unwrap();
        assert_eq!(
            result.lmid_advances,
            vec![("c1".to_string(), 5), ("c2".to_string(), 9)]
        );
    }

    #[test]
    fn app_errors_stay_per_mutation_and_still_advance() {
        let body = batch(&[("c1", 4)]);
        let result = demux(
            &body,
            vec![MutationResult {
                id: 4,
                client_id: "c1".to_string(),
                result: MutationOutcome::AppError { details: json!({"reason": "conflict"}) },
            }],
        )
        .unwrap();
        assert!(matches!(
            result.response.mutations[0].result,
            MutationOutcome::AppError { .. }
        ));
        assert_eq!(result.lmid_advances, vec![("c1".to_string(), 4)]);
    }

    #[test]
    fn out_of_order_fails_the_connection() {
        let body = batch(&[("c1", 4)]);
        let err = demux(
            &body,
            vec![MutationResult {
                id: 4,
                client_id: "c1".to_string(),
                result: MutationOutcome::Ooo,
            }],
        )
        .unwrap_err();
        assert!(matches!(err, PushError::InvalidPush(_)));
    }

    #[test]
    fn auth_failure_bubbles_up() {
        let body = batch(&[("c1", 4)]);
        let err = demux(
            &body,
            vec![MutationResult {
                id: 4,
                client_id: "c1".to_string(),
                result: MutationOutcome::Auth { details: "expired".to_string() },
            }],
        )
        .unwrap_err();
        assert!(matches!(err, PushError::AuthInvalidated(_)));
    }

    #[test]
    fn missing_results_become_network_outcomes() {
        let body = batch(&[("c1", 4), ("c1", 5)]);
        let result = demux(&body, vec![ok("c1", 4)]).unwrap();
        assert!(matches!(
            result.response.mutations[1].result,
            MutationOutcome::Network { .. }
        ));
        assert_eq!(result.lmid_advances, vec![("c1".to_string(), 4)]);
    }
}
