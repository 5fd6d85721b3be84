use serde::{Deserialize, Serialize};

/// What an LLM provider can be used for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LlmCapability {
    Generation,
    Solution,
    Ocr,
    Summary,
}

/// System-wide record describing one LLM provider. The single source of
/// truth for both client construction and the field list the UI renders;
/// serialized verbatim by `providers.list()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub api_url: String,
    pub default_model: String,
    pub capabilities: Vec<LlmCapability>,
    /// Credential field names the UI collects (e.g. `api_key`).
    pub credential_fields: Vec<String>,
    pub user_selectable: bool,
}

impl ProviderSpec {
    pub fn supports(&self, cap: LlmCapability) -> bool {
        self.capabilities.contains(&cap)
    }
}
