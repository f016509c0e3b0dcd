//! Planner client
//!
//! One HTTP round trip per execution unit: `POST PLANNER_URL` with the target
//! and its alerts, answered by an ordered list of shell actions. Any timeout,
//! transport error, non-2xx status or unusable body becomes
//! `PlannerError::Unavailable`; this component never retries.

use crate::models::{Alert, Plan, TargetHost};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),
    #[error("failed to build planner client: {0}")]
    Client(#[source] reqwest::Error),
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn request_plan(&self, target: &TargetHost, alerts: &[Alert]) -> Result<Plan, PlannerError>;
}

#[derive(Serialize)]
struct PlanRequest<'a> {
    target_ip: &'a str,
    alerts: &'a [Alert],
    alert_text: String,
}

#[derive(Deserialize)]
struct PlanResponse {
    #[serde(default)]
    plan_id: Option<String>,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

pub struct HttpPlanner {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpPlanner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PlannerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PlannerError::Client)?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn request_plan(&self, target: &TargetHost, alerts: &[Alert]) -> Result<Plan, PlannerError> {
        let body = PlanRequest {
            target_ip: &target.address,
            alerts,
            alert_text: alert_text(alerts),
        };
        debug!("requesting plan for {} ({} alerts) from {}", target.address, alerts.len(), self.url);

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PlannerError::Unavailable(format!("timed out after {}s", self.timeout.as_secs_f64()))
                } else {
                    PlannerError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PlannerError::Unavailable(format!("planner returned HTTP {}", status)));
        }

        let parsed: PlanResponse = resp
            .json()
            .await
            .map_err(|e| PlannerError::Unavailable(format!("invalid plan response: {}", e)))?;

        let actions: Vec<String> = parsed
            .actions
            .into_iter()
            .filter(|a| !a.trim().is_empty())
            .collect();
        if actions.is_empty() {
            return Err(PlannerError::Unavailable("plan contains no actions".into()));
        }

        Ok(Plan {
            plan_id: parsed
                .plan_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            target_ip: target.address.clone(),
            actions,
            model: parsed.model,
        })
    }
}

/// Human-readable alert digest, one line per alert
pub fn alert_text(alerts: &[Alert]) -> String {
    alerts
        .iter()
        .map(Alert::summary_line)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostRole, ThreatLevel};
    use chrono::Utc;
    use responder_devkit::MockPlanner;

    fn target() -> TargetHost {
        TargetHost {
            role: HostRole::Server,
            address: "172.31.0.10".into(),
        }
    }

    fn alert(attack: &str) -> Alert {
        Alert {
            source_ip: "172.30.0.10".into(),
            dest_ip: "172.31.0.10".into(),
            attack_id: attack.into(),
            threat_level: ThreatLevel::High,
            description: "horizontal scan".into(),
            timestamp: Utc::now(),
            proto: Some("tcp".into()),
        }
    }

    #[tokio::test]
    async fn test_plan_round_trip() {
        let mock = MockPlanner::start().await.unwrap();
        mock.set_actions(vec!["iptables -A INPUT -s 172.30.0.10 -j DROP".into(), "ss -tnp".into()]);
        mock.set_plan_id(Some("plan-42".into()));

        let planner = HttpPlanner::new(mock.url(), Duration::from_secs(5)).unwrap();
        let plan = planner
            .request_plan(&target(), &[alert("portscan-1"), alert("portscan-2")])
            .await
            .unwrap();

        assert_eq!(plan.plan_id, "plan-42");
        assert_eq!(plan.target_ip, "172.31.0.10");
        assert_eq!(plan.actions.len(), 2);

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["target_ip"], "172.31.0.10");
        assert_eq!(requests[0]["alerts"].as_array().unwrap().len(), 2);
        assert_eq!(requests[0]["alerts"][0]["attack_id"], "portscan-1");
        let text = requests[0]["alert_text"].as_str().unwrap();
        assert!(text.contains("172.30.0.10 portscan-1 (tcp) targeting 172.31.0.10 - horizontal scan"));
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_plan_id_is_generated() {
        let mock = MockPlanner::start().await.unwrap();
        mock.set_plan_id(None);

        let planner = HttpPlanner::new(mock.url(), Duration::from_secs(5)).unwrap();
        let plan = planner.request_plan(&target(), &[alert("a")]).await.unwrap();
        assert!(!plan.plan_id.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let mock = MockPlanner::start().await.unwrap();
        mock.set_delay(Duration::from_secs(3));

        let planner = HttpPlanner::new(mock.url(), Duration::from_millis(200)).unwrap();
        let err = planner.request_plan(&target(), &[alert("a")]).await.unwrap_err();
        assert!(matches!(err, PlannerError::Unavailable(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_error_status_is_unavailable() {
        let mock = MockPlanner::start().await.unwrap();
        mock.set_status(503);

        let planner = HttpPlanner::new(mock.url(), Duration::from_secs(5)).unwrap();
        let err = planner.request_plan(&target(), &[alert("a")]).await.unwrap_err();
        assert!(matches!(err, PlannerError::Unavailable(ref msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_empty_plan_is_unavailable() {
        let mock = MockPlanner::start().await.unwrap();
        mock.set_actions(vec![]);

        let planner = HttpPlanner::new(mock.url(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            planner.request_plan(&target(), &[alert("a")]).await,
            Err(PlannerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_planner_is_unavailable() {
        // nothing listens on port 9 of localhost in the test environment
        let planner = HttpPlanner::new("http://127.0.0.1:9/plan", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            planner.request_plan(&target(), &[alert("a")]).await,
            Err(PlannerError::Unavailable(_))
        ));
    }
}
