use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Plain-text reply the agent sends for simple successes.
pub const ACK: &str = "ACK";

/// One RPC to the in-guest agent. Messages are JSON, one per connection,
/// line-terminated; `type` selects the operation and `token` must match
/// the tenant's agentToken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentRequest {
    InjectSecrets {
        token: String,
        secrets: serde_json::Value,
    },
    HealthPing {
        token: String,
    },
    LaunchOpenclaw {
        token: String,
    },
    Shutdown {
        token: String,
    },
    AcquireHold {
        token: String,
        id: String,
        ttl_ms: u64,
    },
    ReleaseHold {
        token: String,
        id: String,
    },
    GetActiveConnections {
        token: String,
    },
    FetchLogs {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
}

impl AgentRequest {
    /// The wire name of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InjectSecrets { .. } => "inject-secrets",
            Self::HealthPing { .. } => "health-ping",
            Self::LaunchOpenclaw { .. } => "launch-openclaw",
            Self::Shutdown { .. } => "shutdown",
            Self::AcquireHold { .. } => "acquire-hold",
            Self::ReleaseHold { .. } => "release-hold",
            Self::GetActiveConnections { .. } => "get-active-connections",
            Self::FetchLogs { .. } => "fetch-logs",
        }
    }
}

/// What came back over the wire: the bare ACK line or a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    Ack,
    Json(serde_json::Value),
}

impl AgentResponse {
    /// Parse one response line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line == ACK {
            return Ok(Self::Ack);
        }
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            Error::ValidationFailed(format!("unparseable agent response {:?}: {}", line, e))
        })?;
        if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
            return Err(Error::ValidationFailed(format!("agent error: {}", err)));
        }
        Ok(Self::Json(value))
    }

    /// Deserialize the JSON form into a typed reply.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Ack => Err(Error::ValidationFailed(
                "expected a JSON reply, got ACK".to_string(),
            )),
            Self::Json(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::ValidationFailed(format!("bad agent reply: {}", e))),
        }
    }
}

/// Reply to `get-active-connections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsReply {
    pub active_connections: u64,
}

/// Reply to `fetch-logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsReply {
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}
