use serde::{Deserialize, Serialize};

/// Symbolic model tiers exposed to clients.
///
/// The wire names match the upstream's model identifiers so the gateway can
/// pass them through without a mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelTier {
    #[serde(rename = "haiku")]
    Fast,
    #[serde(rename = "sonnet")]
    Balanced,
    #[serde(rename = "opus")]
    Heavy,
}

impl ModelTier {
    /// The upstream wire name for this tier.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ModelTier::Fast => "haiku",
            ModelTier::Balanced => "sonnet",
            ModelTier::Heavy => "opus",
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "haiku" => Ok(ModelTier::Fast),
            "sonnet" => Ok(ModelTier::Balanced),
            "opus" => Ok(ModelTier::Heavy),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Token and cost snapshot reported by the upstream during a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

/// Attachment descriptor sent by the client alongside a message.
///
/// The file itself was uploaded out of band; `path` is where it lives under
/// the upload root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}
