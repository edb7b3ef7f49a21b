use serde::{Deserialize, Serialize};

use tiller_core::ModelTier;

/// A persisted conversation session.
///
/// `session_id` is the client-visible UUID; `claude_session_id` is whatever
/// the upstream last reported for this conversation. The two start out equal
/// on a fresh session and drift apart when the upstream mints a new id on
/// resume — see `Store::relink_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub session_id: String,
    pub claude_session_id: Option<String>,
    pub title: Option<String>,
    pub model: ModelTier,
    pub created_at: String,
    pub last_activity: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_usd: f64,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Thinking,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Thinking => "thinking",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "thinking" => Ok(Role::Thinking),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One message row. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// Tool invocation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Running => "running",
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ToolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ToolStatus::Running),
            "success" => Ok(ToolStatus::Success),
            "error" => Ok(ToolStatus::Error),
            other => Err(format!("unknown tool status: {other}")),
        }
    }
}

/// A recorded tool invocation.
///
/// Created when the start frame is observed (status = running) and mutated
/// exactly once when the result frame lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: i64,
    pub session_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub status: ToolStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// A durable user-level fact injected into prompts while enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// SSH credential kind for a machine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Password,
    Key,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Password => "password",
            AuthType::Key => "key",
        }
    }
}

impl std::str::FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password" => Ok(AuthType::Password),
            "key" => Ok(AuthType::Key),
            other => Err(format!("unknown auth type: {other}")),
        }
    }
}

/// An SSH target the agent can be pointed at.
///
/// `auth_value` is stored encrypted; use `Store::machine_auth` to recover
/// the plaintext credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(skip_serializing)]
    pub auth_value: String,
    pub status: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One full-text search hit with its highlighted snippet.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message: MessageRecord,
    pub snippet: String,
}
