use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::from_slice;

use crate::events::GithubRepository;

/// Fields read before the signature check. Everything is optional, `ping` carries almost nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookCommonFields {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub repository: Option<GithubRepository>,
    #[serde(default)]
    pub installation: Option<Installation>,
}

/// One variant per supported event and action pair.
#[derive(Debug, Clone)]
pub enum GithubEvent {
    // https://rust-lang.github.io/rust-clippy/master/index.html#/large_enum_variant
    /// `check_suite.requested` and `check_suite.rerequested`.
    CheckSuiteRequested(Box<CheckSuiteEvent>),
    CheckRunCreated(Box<CheckRunEvent>),
    CheckRunRerequested(Box<CheckRunEvent>),
    CheckRunRequestedAction(Box<CheckRunEvent>),
    /// `pull_request.opened` and `pull_request.reopened`.
    PullRequestOpened(Box<PullRequestEvent>),
    PullRequestLabeled(Box<PullRequestEvent>),
}

impl GithubEvent {
    /// Parse `body` as the event named by the headers. `None` if nothing handles the pair.
    pub fn parse(event_name: &str, action: &str, body: &[u8]) -> Result<Option<Self>> {
        let event = match (event_name, action) {
            ("check_suite", "requested" | "rerequested") => {
                Self::CheckSuiteRequested(parse(event_name, body)?)
            }
            ("check_run", "created") => Self::CheckRunCreated(parse(event_name, body)?),
            ("check_run", "rerequested") => Self::CheckRunRerequested(parse(event_name, body)?),
            ("check_run", "requested_action") => {
                Self::CheckRunRequestedAction(parse(event_name, body)?)
            }
            ("pull_request", "opened" | "reopened") => {
                Self::PullRequestOpened(parse(event_name, body)?)
            }
            ("pull_request", "labeled") => Self::PullRequestLabeled(parse(event_name, body)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn installation_id(&self) -> i64 {
        match self {
            Self::CheckSuiteRequested(e) => e.installation.id,
            Self::CheckRunCreated(e)
            | Self::CheckRunRerequested(e)
            | Self::CheckRunRequestedAction(e) => e.installation.id,
            Self::PullRequestOpened(e) | Self::PullRequestLabeled(e) => e.installation.id,
        }
    }
}

fn parse<T: DeserializeOwned>(event_name: &str, body: &[u8]) -> Result<Box<T>> {
    from_slice(body).with_context(|| format!("failed to parse {event_name} event"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
}

// https://docs.github.com/en/webhooks/webhook-events-and-payloads#check_suite
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSuiteEvent {
    pub action: String,
    pub repository: GithubRepository,
    pub installation: Installation,
    pub check_suite: CheckSuite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSuite {
    pub head_sha: String,
}

// https://docs.github.com/en/webhooks/webhook-events-and-payloads#check_run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRunEvent {
    pub action: String,
    pub repository: GithubRepository,
    pub installation: Installation,
    pub check_run: CheckRun,
    /// Only on `requested_action`.
    #[serde(default)]
    pub requested_action: Option<RequestedActionField>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub head_sha: String,
    pub app: App,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct App {
    pub id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestedActionField {
    pub identifier: String,
}

// https://docs.github.com/en/webhooks/webhook-events-and-payloads#pull_request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub repository: GithubRepository,
    pub installation: Installation,
    /// The pull request number.
    pub number: u64,
    pub pull_request: PullRequest,
    /// Only on `labeled` and `unlabeled`.
    #[serde(default)]
    pub label: Option<Label>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub head: Reference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn repository() -> serde_json::Value {
        json!({"full_name": "octocat/hello", "name": "hello", "owner": {"login": "octocat"}})
    }

    #[test]
    fn check_suite() {
        let body = json!({
            "action": "requested",
            "repository": repository(),
            "installation": {"id": 7},
            "check_suite": {"head_sha": "abc123", "id": 1},
        });
        let event = GithubEvent::parse("check_suite", "requested", body.to_string().as_bytes())
            .unwrap()
            .unwrap();
        let GithubEvent::CheckSuiteRequested(e) = &event else {
            panic!("unexpected event: {event:?}");
        };
        assert_eq!(e.check_suite.head_sha, "abc123");
        assert_eq!(e.repository.owner(), "octocat");
        assert_eq!(event.installation_id(), 7);
    }

    #[test]
    fn check_run_requested_action() {
        let body = json!({
            "action": "requested_action",
            "repository": repository(),
            "installation": {"id": 7},
            "check_run": {"id": 5, "name": "status-checker", "head_sha": "abc123", "app": {"id": 4242}},
            "requested_action": {"identifier": "turn_on"},
        });
        let event =
            GithubEvent::parse("check_run", "requested_action", body.to_string().as_bytes())
                .unwrap()
                .unwrap();
        let GithubEvent::CheckRunRequestedAction(e) = event else {
            panic!("unexpected event: {event:?}");
        };
        assert_eq!(e.check_run.app.id, 4242);
        assert_eq!(e.requested_action.unwrap().identifier, "turn_on");
    }

    #[test]
    fn pull_request_labeled() {
        let body = json!({
            "action": "labeled",
            "number": 12,
            "repository": repository(),
            "installation": {"id": 7},
            "pull_request": {"number": 12, "head": {"ref": "feature", "sha": "abc123"}},
            "label": {"name": "ci:skip"},
        });
        let event = GithubEvent::parse("pull_request", "labeled", body.to_string().as_bytes())
            .unwrap()
            .unwrap();
        let GithubEvent::PullRequestLabeled(e) = event else {
            panic!("unexpected event: {event:?}");
        };
        assert_eq!(e.number, 12);
        assert_eq!(e.pull_request.head.ref_, "feature");
        assert_eq!(e.label.unwrap().name, "ci:skip");
    }

    #[test]
    fn unsupported_pairs() {
        for (name, action) in [
            ("check_suite", "completed"),
            ("check_run", "completed"),
            ("pull_request", "synchronize"),
            ("push", ""),
        ] {
            assert!(
                GithubEvent::parse(name, action, b"not even json")
                    .unwrap()
                    .is_none(),
                "{name}.{action}"
            );
        }
    }

    #[test]
    fn missing_installation() {
        let body = json!({
            "action": "requested",
            "repository": repository(),
            "check_suite": {"head_sha": "abc123"},
        });
        let err = GithubEvent::parse("check_suite", "requested", body.to_string().as_bytes())
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to parse check_suite event");
    }

    #[test]
    fn common_fields_of_ping() {
        let common: WebhookCommonFields =
            serde_json::from_value(json!({"zen": "Keep it logically awesome.", "hook_id": 1}))
                .unwrap();
        assert!(common.action.is_none());
        assert!(common.repository.is_none());
    }
}
