/*!
Mock planning service

Real axum server bound to an ephemeral localhost port. Every `POST /plan`
body is recorded; the reply (actions, plan id, status, artificial delay) can
be changed between requests.
*/

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Behaviour {
    actions: Vec<String>,
    plan_id: Option<String>,
    status: u16,
    delay: Duration,
    counter: u64,
}

#[derive(Default)]
struct Recorded {
    requests: Vec<Value>,
}

#[derive(Clone)]
struct MockState {
    behaviour: Arc<Mutex<Behaviour>>,
    recorded: Arc<Mutex<Recorded>>,
}

pub struct MockPlanner {
    addr: SocketAddr,
    state: MockState,
    server: JoinHandle<()>,
}

impl MockPlanner {
    /// Start the server; replies with a single `echo` action until configured otherwise
    pub async fn start() -> Result<Self> {
        let state = MockState {
            behaviour: Arc::new(Mutex::new(Behaviour {
                actions: vec!["echo remediation".into()],
                plan_id: None,
                status: 200,
                delay: Duration::ZERO,
                counter: 0,
            })),
            recorded: Arc::new(Mutex::new(Recorded::default())),
        };

        let app = Router::new()
            .route("/plan", post(handle_plan))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind mock planner")?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("[MOCK] planner server stopped: {}", e);
            }
        });

        log::info!("[MOCK] planner listening on {}", addr);
        Ok(Self { addr, state, server })
    }

    pub fn url(&self) -> String {
        format!("http://{}/plan", self.addr)
    }

    pub fn set_actions(&self, actions: Vec<String>) {
        self.state.behaviour.lock().actions = actions;
    }

    /// Fixed plan id; `None` generates `mock-plan-<n>` per request
    pub fn set_plan_id(&self, plan_id: Option<String>) {
        self.state.behaviour.lock().plan_id = plan_id;
    }

    pub fn set_status(&self, status: u16) {
        self.state.behaviour.lock().status = status;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.behaviour.lock().delay = delay;
    }

    /// Request bodies received so far, in arrival order
    pub fn requests(&self) -> Vec<Value> {
        self.state.recorded.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.recorded.lock().requests.len()
    }
}

impl Drop for MockPlanner {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle_plan(State(state): State<MockState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state.recorded.lock().requests.push(body);

    let (delay, status, reply) = {
        let mut behaviour = state.behaviour.lock();
        behaviour.counter += 1;
        let plan_id = behaviour
            .plan_id
            .clone()
            .unwrap_or_else(|| format!("mock-plan-{}", behaviour.counter));
        let reply = json!({
            "plan_id": plan_id,
            "actions": behaviour.actions,
            "model": "mock",
        });
        (behaviour.delay, behaviour.status, reply)
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_success() {
        (status, Json(reply))
    } else {
        (status, Json(json!({"error": "mock planner failure"})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_requests_and_replies() {
        crate::init_test_logging();
        let mock = MockPlanner::start().await.unwrap();
        mock.set_actions(vec!["id".into()]);

        let client = reqwest::Client::new();
        let resp: Value = client
            .post(mock.url())
            .json(&json!({"target_ip": "172.31.0.10", "alerts": []}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(resp["actions"], json!(["id"]));
        assert_eq!(resp["plan_id"], "mock-plan-1");
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.requests()[0]["target_ip"], "172.31.0.10");
    }

    #[tokio::test]
    async fn test_configured_status() {
        let mock = MockPlanner::start().await.unwrap();
        mock.set_status(500);

        let resp = reqwest::Client::new()
            .post(mock.url())
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 500);
        assert_eq!(mock.request_count(), 1);
    }
}
