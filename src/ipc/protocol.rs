// IPC Protocol definitions for the control socket

use crate::process::{AppOutcome, AppStatus};
use serde::{Deserialize, Serialize};

/// Control commands; `None` for a name means every app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Start { name: Option<String> },
    Stop { name: Option<String>, force: bool },
    Restart { name: String },
    Status,
    Shutdown,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Per-app results of a start, stop or restart
    Outcomes(Vec<AppOutcome>),
    /// Snapshot of every app in configuration order
    Status(Vec<AppStatus>),
    /// Stop-all finished; the supervisor is exiting
    ShuttingDown(Vec<AppOutcome>),
}

impl ResponseData {
    /// Whether every app reached the requested state
    pub fn all_ok(&self) -> bool {
        match self {
            ResponseData::Outcomes(outcomes) | ResponseData::ShuttingDown(outcomes) => {
                outcomes.iter().all(AppOutcome::is_ok)
            }
            ResponseData::Status(_) => true,
        }
    }
}

/// Request message from client to supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from supervisor to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;

    #[test]
    fn test_request_wire_format() {
        let request = Request::new(
            7,
            Command::Stop {
                name: Some("web".to_string()),
                force: true,
            },
        );
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"id":7,"command":{"Stop":{"name":"web","force":true}}}"#
        );

        let status = serde_json::to_string(&Request::new(1, Command::Status)).unwrap();
        assert_eq!(status, r#"{"id":1,"command":"Status"}"#);
    }

    #[test]
    fn test_all_ok() {
        let data = ResponseData::Outcomes(vec![
            AppOutcome::ok("web", ProcessState::Running),
            AppOutcome::failed("worker", ProcessState::Stopped, "restart budget exhausted"),
        ]);
        assert!(!data.all_ok());
        assert!(ResponseData::Status(vec![]).all_ok());
    }

    #[test]
    fn test_error_response_round_trip() {
        let response = Response::error(3, "App not found: api".to_string());
        let json = serde_json::to_string(&response).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 3);
        assert_eq!(parsed.result, Err("App not found: api".to_string()));
    }
}
