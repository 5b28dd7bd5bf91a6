//! Client side of the remote evaluation service.
//!
//! The service executes one payload per job: `POST /submit` returns a job id and
//! `POST /status` reports `pending`, `done` (with `result`) or `error`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::DispatcherConfig;
use crate::error::Error;

/// Where an evaluation request comes from inside its case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EvalOrigin {
    BatchCandidate { round: usize, index: usize },
    RefineStep { seed: u64, step: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPayload {
    pub case_id: String,
    pub origin: EvalOrigin,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, payload: &EvalPayload) -> Result<String>;
    async fn poll(&self, job_id: &str) -> Result<JobStatus>;
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, route: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.endpoint, route);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "dispatcher {} returned {}: {}",
                url,
                status,
                text.trim()
            ));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn submit(&self, payload: &EvalPayload) -> Result<String> {
        let body = json!({
            "params": payload.params,
            "case_id": payload.case_id,
            "origin": payload.origin,
        });
        let reply = self.post("submit", &body).await?;
        match reply.get("job_id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(Error::DispatcherProtocol(format!(
                "submit reply has no job_id: {}",
                reply
            ))
            .into()),
        }
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus> {
        let reply = self.post("status", &json!({ "job_id": job_id })).await?;
        serde_json::from_value::<JobStatus>(reply.clone()).map_err(|e| {
            Error::DispatcherProtocol(format!("bad status reply {}: {}", reply, e)).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Serves `/submit` and `/status` from a background thread; status flips to
    /// `done` on the second poll.
    fn spawn_fake_service(requests: usize) -> (String, thread::JoinHandle<Vec<Value>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut polls = 0;
            for _ in 0..requests {
                let mut request = match server.recv() {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                seen.push(parsed);
                let reply = match request.url() {
                    "/submit" => json!({ "job_id": 17 }),
                    "/status" => {
                        polls += 1;
                        if polls < 2 {
                            json!({ "state": "pending" })
                        } else {
                            json!({ "state": "done", "result": { "chi2": 0.5 } })
                        }
                    }
                    _ => json!({}),
                };
                let _ = request.respond(tiny_http::Response::from_string(reply.to_string()));
            }
            seen
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn http_dispatcher_submits_and_polls() {
        let (endpoint, server) = spawn_fake_service(3);
        let dispatcher = HttpDispatcher::new(&DispatcherConfig {
            endpoint,
            ..DispatcherConfig::default()
        })
        .expect("client");
        let payload = EvalPayload {
            case_id: "../Case/Case_001".to_string(),
            origin: EvalOrigin::BatchCandidate { round: 0, index: 2 },
            params: json!({ "thk": [100, 200] }),
        };
        let job_id = dispatcher.submit(&payload).await.expect("submit");
        assert_eq!(job_id, "17");
        let first = dispatcher.poll(&job_id).await.expect("poll 1");
        assert_eq!(first.state, JobState::Pending);
        let second = dispatcher.poll(&job_id).await.expect("poll 2");
        assert_eq!(second.state, JobState::Done);
        assert_eq!(second.result, Some(json!({ "chi2": 0.5 })));

        let seen = server.join().expect("server thread");
        assert_eq!(seen[0]["params"], json!({ "thk": [100, 200] }));
        assert_eq!(seen[0]["origin"]["phase"], "batch_candidate");
        assert_eq!(seen[1]["job_id"], "17");
    }

    /// Answers each request with the next canned `(status, body)` pair.
    fn spawn_scripted_service(replies: Vec<(u16, Value)>) -> (String, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        let handle = thread::spawn(move || {
            for (code, body) in replies {
                let request = match server.recv() {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let response =
                    tiny_http::Response::from_string(body.to_string()).with_status_code(code);
                let _ = request.respond(response);
            }
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn http_dispatcher_rejects_bad_replies() {
        let (endpoint, server) = spawn_scripted_service(vec![
            (200, json!({ "queued": true })),
            (503, json!({ "detail": "solver pool busy" })),
            (200, json!({ "state": "exploded" })),
        ]);
        let dispatcher = HttpDispatcher::new(&DispatcherConfig {
            endpoint,
            ..DispatcherConfig::default()
        })
        .expect("client");
        let payload = EvalPayload {
            case_id: "c1".to_string(),
            origin: EvalOrigin::BatchCandidate { round: 0, index: 0 },
            params: json!({}),
        };

        let err = dispatcher.submit(&payload).await.expect_err("missing job_id");
        match err.downcast_ref::<Error>() {
            Some(Error::DispatcherProtocol(detail)) => {
                assert!(detail.contains("no job_id"), "{}", detail)
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = dispatcher.poll("17").await.expect_err("service unavailable");
        let message = err.to_string();
        assert!(message.contains("503"), "{}", message);
        assert!(message.contains("solver pool busy"), "{}", message);
        assert!(err.downcast_ref::<Error>().is_none());

        let err = dispatcher.poll("17").await.expect_err("unknown state");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DispatcherProtocol(_))
        ));
        server.join().expect("server thread");
    }

    #[test]
    fn job_status_accepts_error_reply() {
        let status: JobStatus =
            serde_json::from_value(json!({ "state": "error", "error": "solver diverged" }))
                .expect("parse");
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.error.as_deref(), Some("solver diverged"));
        assert!(status.result.is_none());
    }
}
