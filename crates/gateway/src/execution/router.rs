//! Pure routing from request properties to a transport target.
//!
//! The router does not care what the execution service is — only the
//! communication mode and the address.

use tm_domain::config::ExecutorEndpoints;
use tm_domain::ExecutionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationMode {
    /// Active request with a long connection; events stream back inline.
    Sse,
    /// Passive: the executor is already connected, we push to its room.
    Websocket,
    /// Fire the request, events come back through `/internal/callback`.
    HttpCallback,
}

#[derive(Debug, Clone)]
pub struct ExecutionTarget {
    pub mode: CommunicationMode,
    pub url: Option<String>,
    pub endpoint: String,
    pub namespace: Option<String>,
    pub event: String,
    pub room: Option<String>,
}

pub struct ExecutionRouter {
    chat_shell_url: String,
    executor_manager_url: String,
}

impl ExecutionRouter {
    pub fn new(endpoints: &ExecutorEndpoints) -> Self {
        Self {
            chat_shell_url: endpoints.chat_shell_url.clone(),
            executor_manager_url: endpoints.executor_manager_url.clone(),
        }
    }

    /// Routing priority:
    /// 1. `device_id` set → WebSocket to the device room
    /// 2. shell-type table lookup
    /// 3. default → HTTP+Callback to the executor manager
    pub fn route(&self, request: &ExecutionRequest, device_id: Option<&str>) -> ExecutionTarget {
        if let Some(device_id) = device_id {
            let user_id = request.user_id().unwrap_or(0);
            return ExecutionTarget {
                mode: CommunicationMode::Websocket,
                url: None,
                endpoint: String::new(),
                namespace: Some("/local-executor".into()),
                event: "task:execute".into(),
                room: Some(tm_protocol::device_room(user_id, device_id)),
            };
        }

        match request.shell_type() {
            "Chat" => ExecutionTarget {
                mode: CommunicationMode::Sse,
                url: Some(self.chat_shell_url.clone()),
                endpoint: "/v1/responses".into(),
                namespace: None,
                event: String::new(),
                room: None,
            },
            // ClaudeCode, Agno, Dify, and anything unknown go through
            // the executor manager.
            _ => ExecutionTarget {
                mode: CommunicationMode::HttpCallback,
                url: Some(self.executor_manager_url.clone()),
                endpoint: "/v1/execute".into(),
                namespace: None,
                event: String::new(),
                room: None,
            },
        }
    }

    /// Only SSE mode streams inline.
    pub fn supports_streaming(&self, request: &ExecutionRequest) -> bool {
        self.route(request, None).mode == CommunicationMode::Sse
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tm_domain::request::{BotSpec, UserRef};

    fn router() -> ExecutionRouter {
        ExecutionRouter::new(&ExecutorEndpoints {
            chat_shell_url: "http://chat:8100".into(),
            executor_manager_url: "http://manager:8001".into(),
            ..Default::default()
        })
    }

    fn request_with_shell(shell_type: Option<&str>) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(42, 7);
        request.user = Some(UserRef {
            id: 1,
            ..Default::default()
        });
        if let Some(shell_type) = shell_type {
            request.bot = vec![BotSpec {
                shell_type: Some(shell_type.into()),
                ..Default::default()
            }];
        }
        request
    }

    #[test]
    fn device_id_wins_over_shell_type() {
        let target = router().route(&request_with_shell(Some("Chat")), Some("abc"));
        assert_eq!(target.mode, CommunicationMode::Websocket);
        assert_eq!(target.namespace.as_deref(), Some("/local-executor"));
        assert_eq!(target.event, "task:execute");
        assert_eq!(target.room.as_deref(), Some("device:1:abc"));
    }

    #[test]
    fn chat_shell_routes_to_sse() {
        let target = router().route(&request_with_shell(Some("Chat")), None);
        assert_eq!(target.mode, CommunicationMode::Sse);
        assert_eq!(target.url.as_deref(), Some("http://chat:8100"));
        assert_eq!(target.endpoint, "/v1/responses");
    }

    #[test]
    fn container_shells_route_to_manager() {
        for shell in ["ClaudeCode", "Agno", "Dify"] {
            let target = router().route(&request_with_shell(Some(shell)), None);
            assert_eq!(target.mode, CommunicationMode::HttpCallback);
            assert_eq!(target.url.as_deref(), Some("http://manager:8001"));
            assert_eq!(target.endpoint, "/v1/execute");
        }
    }

    #[test]
    fn empty_bot_list_defaults_to_chat_sse() {
        let target = router().route(&request_with_shell(None), None);
        assert_eq!(target.mode, CommunicationMode::Sse);
    }

    #[test]
    fn unknown_shell_type_defaults_to_http_callback() {
        let target = router().route(&request_with_shell(Some("Mystery")), None);
        assert_eq!(target.mode, CommunicationMode::HttpCallback);
    }

    #[test]
    fn streaming_support() {
        assert!(router().supports_streaming(&request_with_shell(Some("Chat"))));
        assert!(!router().supports_streaming(&request_with_shell(Some("ClaudeCode"))));
    }
}
