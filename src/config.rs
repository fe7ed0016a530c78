use std::time::Duration;

use crate::models::Role;

/// Everything the conversation core needs from the host application. Passed
/// in explicitly at construction; the core never reads ambient global state.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// REST base, e.g. `https://chat.example.com`. A trailing slash is
    /// tolerated.
    pub api_base: String,
    /// Push endpoint base. Derived from `api_base` when unset.
    pub ws_base: Option<String>,
    /// Bearer credential attached to every REST call and to the push
    /// channel's query string. May be empty, in which case rooms run in
    /// fetch-only mode without a live channel.
    pub token: String,
    /// Local participant id. Numeric, since room keys are derived from it.
    pub user_id: String,
    pub role: Role,
    /// Bound applied to every REST call, uploads included.
    pub request_timeout: Duration,
}

impl ChatConfig {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        user_id: impl Into<String>,
        role: Role,
    ) -> Self {
        ChatConfig {
            api_base: api_base.into(),
            ws_base: None,
            token: token.into(),
            user_id: user_id.into(),
            role,
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Point the push channel somewhere other than the REST host.
    pub fn with_ws_base(mut self, ws_base: impl Into<String>) -> Self {
        self.ws_base = Some(ws_base.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Push address for one room:
    /// `ws(s)://host/ws/chat/{room_key}/?token={credential}`.
    pub fn ws_endpoint(&self, room_key: &str) -> String {
        let base = match &self.ws_base {
            Some(base) => base.clone(),
            None => websocket_base(&self.api_base),
        };
        format!(
            "{}/ws/chat/{}/?token={}",
            base.trim_end_matches('/'),
            room_key,
            self.token
        )
    }
}

/// Map an http(s) base onto its ws(s) counterpart.
fn websocket_base(api_base: &str) -> String {
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", api_base)
    }
}
