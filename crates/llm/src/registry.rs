//! Static provider definitions. Adding a provider means adding one entry
//! here; both client construction and the UI field list derive from it.

use ojforge_models::{LlmCapability, ProviderSpec};
use std::sync::OnceLock;

fn spec(
    id: &str,
    name: &str,
    description: &str,
    api_url: &str,
    default_model: &str,
    capabilities: &[LlmCapability],
    user_selectable: bool,
) -> ProviderSpec {
    ProviderSpec {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        api_url: api_url.into(),
        default_model: default_model.into(),
        capabilities: capabilities.to_vec(),
        credential_fields: vec!["api_key".into(), "api_url".into(), "model".into()],
        user_selectable,
    }
}

/// All known providers, in display order.
pub fn providers() -> &'static [ProviderSpec] {
    static PROVIDERS: OnceLock<Vec<ProviderSpec>> = OnceLock::new();
    PROVIDERS
        .get_or_init(|| {
            vec![
                spec(
                    "deepseek",
                    "DeepSeek",
                    "DeepSeek Reasoner, strong at generation and solving",
                    "https://api.deepseek.com/v1",
                    "deepseek-reasoner",
                    &[
                        LlmCapability::Generation,
                        LlmCapability::Solution,
                        LlmCapability::Summary,
                    ],
                    true,
                ),
                spec(
                    "openai",
                    "OpenAI-compatible",
                    "Any service speaking the OpenAI chat API",
                    "https://api.openai.com/v1",
                    "gpt-4",
                    &[
                        LlmCapability::Generation,
                        LlmCapability::Solution,
                        LlmCapability::Summary,
                    ],
                    true,
                ),
                spec(
                    "siliconflow",
                    "SiliconFlow",
                    "OCR-only provider for statement images",
                    "https://api.siliconflow.cn/v1",
                    "deepseek-ai/DeepSeek-OCR",
                    &[LlmCapability::Ocr],
                    false,
                ),
            ]
        })
        .as_slice()
}

pub fn provider(id: &str) -> Option<&'static ProviderSpec> {
    providers().iter().find(|p| p.id == id)
}

pub fn providers_with(capability: LlmCapability) -> Vec<&'static ProviderSpec> {
    providers().iter().filter(|p| p.supports(capability)).collect()
}

pub fn user_selectable_providers() -> Vec<&'static ProviderSpec> {
    providers().iter().filter(|p| p.user_selectable).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_provider_is_not_selectable() {
        let ocr = providers_with(LlmCapability::Ocr);
        assert_eq!(ocr.len(), 1);
        assert!(!ocr[0].user_selectable);
        assert!(!user_selectable_providers()
            .iter()
            .any(|p| p.id == "siliconflow"));
    }

    #[test]
    fn every_provider_declares_credential_fields() {
        for p in providers() {
            assert!(p.credential_fields.contains(&"api_key".to_string()));
        }
    }
}
