//! Typed endpoint pool over the provider registry.

use crate::client::{Completion, CompletionRequest, HttpProviderClient, ProviderClient};
use crate::{registry, LlmError};
use ojforge_concurrency::{GatePool, GATE_LLM_TOTAL};
use ojforge_models::{LlmCapability, PipelineResult, ProviderSpec};
use ojforge_storage::Repository;
use secrecy::SecretString;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Typed endpoints the stages call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmEndpoint {
    Generation,
    Solution,
    Ocr,
    Summary,
}

impl LlmEndpoint {
    fn capability(&self) -> LlmCapability {
        match self {
            LlmEndpoint::Generation => LlmCapability::Generation,
            LlmEndpoint::Solution => LlmCapability::Solution,
            LlmEndpoint::Ocr => LlmCapability::Ocr,
            LlmEndpoint::Summary => LlmCapability::Summary,
        }
    }
}

/// Call options; temperature is tuned per stage and cooled on retries.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: None,
        }
    }
}

/// Completion enriched with accounting.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub tokens: u64,
    pub latency_ms: u64,
}

/// Outcome of a provider health check.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub ok: bool,
    pub message: String,
}

type ClientFactory =
    Box<dyn Fn(&ProviderSpec, &HashMap<String, String>) -> Arc<dyn ProviderClient> + Send + Sync>;

/// Pool of lazily-constructed provider clients. Every call holds the
/// `llm.total` gate plus the per-provider gate for its duration.
pub struct LlmPool {
    gates: Arc<GatePool>,
    repo: Arc<dyn Repository>,
    timeout: Duration,
    endpoints: RwLock<HashMap<LlmEndpoint, String>>,
    clients: RwLock<HashMap<String, Arc<dyn ProviderClient>>>,
    factory: ClientFactory,
}

impl LlmPool {
    pub fn new(gates: Arc<GatePool>, repo: Arc<dyn Repository>, timeout: Duration) -> Arc<Self> {
        let transport = reqwest::Client::new();
        Arc::new(Self {
            gates,
            repo,
            timeout,
            endpoints: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            factory: Box::new(move |spec, creds| {
                Arc::new(HttpProviderClient::new(
                    transport.clone(),
                    spec,
                    SecretString::new(creds.get("api_key").cloned().unwrap_or_default()),
                    creds.get("api_url").cloned(),
                    creds.get("model").cloned(),
                ))
            }),
        })
    }

    /// Pool with pre-wired clients; tests inject scripted transports here.
    /// Construction of further clients is refused.
    pub fn with_clients(
        gates: Arc<GatePool>,
        repo: Arc<dyn Repository>,
        clients: HashMap<String, Arc<dyn ProviderClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gates,
            repo,
            timeout: Duration::from_secs(300),
            endpoints: RwLock::new(HashMap::new()),
            clients: RwLock::new(clients),
            factory: Box::new(|spec, _| panic!("no client wired for provider {}", spec.id)),
        })
    }

    /// Route `endpoint` to a specific provider (e.g. the task's chosen LLM
    /// for generation and solving).
    pub async fn assign_endpoint(&self, endpoint: LlmEndpoint, provider_id: &str) {
        self.endpoints
            .write()
            .await
            .insert(endpoint, provider_id.to_string());
    }

    async fn provider_for(&self, endpoint: LlmEndpoint) -> Result<&'static ProviderSpec, LlmError> {
        if let Some(id) = self.endpoints.read().await.get(&endpoint) {
            return registry::provider(id)
                .filter(|p| p.supports(endpoint.capability()))
                .ok_or_else(|| {
                    LlmError::BadResponse(format!("provider {id} cannot serve {endpoint:?}"))
                });
        }
        registry::providers_with(endpoint.capability())
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::BadResponse(format!("no provider serves {endpoint:?}")))
    }

    /// Lazily construct (and cache) the client for a provider. Credential
    /// absence surfaces here, so it only errors when the endpoint is
    /// actually used.
    async fn client_for(&self, spec: &ProviderSpec) -> Result<Arc<dyn ProviderClient>, LlmError> {
        if let Some(client) = self.clients.read().await.get(&spec.id) {
            return Ok(Arc::clone(client));
        }
        let creds = self
            .repo
            .get_provider_credentials(&spec.id)
            .await
            .map_err(|e| LlmError::BadResponse(format!("credential load failed: {e}")))?
            .ok_or_else(|| LlmError::Auth(format!("no credentials for provider {}", spec.id)))?;
        if creds.get("api_key").map_or(true, |k| k.is_empty()) {
            return Err(LlmError::Auth(format!(
                "provider {} has an empty api_key",
                spec.id
            )));
        }
        let creds: HashMap<String, String> = creds.into_iter().collect();
        let client = (self.factory)(spec, &creds);
        self.clients
            .write()
            .await
            .insert(spec.id.clone(), Arc::clone(&client));
        info!(provider = %spec.id, "constructed llm client");
        Ok(client)
    }

    /// One completion call under the llm gates with the pool timeout.
    pub async fn call(
        &self,
        endpoint: LlmEndpoint,
        prompt: &str,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<LlmReply> {
        let spec = self.provider_for(endpoint).await?;

        let _total = self.gates.acquire(GATE_LLM_TOTAL, cancel).await?;
        let provider_gate = GatePool::provider_gate_name(&spec.id);
        let _provider = self.gates.acquire(&provider_gate, cancel).await?;

        let client = self.client_for(spec).await?;
        let request = CompletionRequest {
            prompt: prompt.to_string(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let completion: Completion = tokio::select! {
            result = tokio::time::timeout(self.timeout, client.complete(request)) => {
                match result {
                    Ok(Ok(c)) => c,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        warn!(provider = %spec.id, timeout_s = self.timeout.as_secs(), "llm call timed out");
                        return Err(LlmError::Timeout(self.timeout.as_secs()).into());
                    }
                }
            }
            _ = cancel.cancelled() => return Err(LlmError::Cancelled.into()),
        };

        Ok(LlmReply {
            text: completion.text,
            tokens: completion.tokens,
            latency_ms: completion.latency_ms,
        })
    }

    /// Provider health check. `full = false` validates credential shape
    /// without a network call; `full = true` sends a minimal real prompt.
    pub async fn test(&self, provider_id: &str, full: bool) -> TestReport {
        let Some(spec) = registry::provider(provider_id) else {
            return TestReport {
                ok: false,
                message: format!("unknown provider: {provider_id}"),
            };
        };

        let creds = match self.repo.get_provider_credentials(provider_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return TestReport {
                    ok: false,
                    message: "no credentials saved".into(),
                }
            }
            Err(e) => {
                return TestReport {
                    ok: false,
                    message: format!("credential load failed: {e}"),
                }
            }
        };
        if creds.get("api_key").map_or(true, |k| k.is_empty()) {
            return TestReport {
                ok: false,
                message: "api_key is empty".into(),
            };
        }
        if !full {
            return TestReport {
                ok: true,
                message: format!("{} credentials look valid", spec.name),
            };
        }

        match self.client_for(spec).await {
            Ok(client) => {
                let probe = CompletionRequest {
                    prompt: "Reply with the single word: ok".into(),
                    temperature: 0.0,
                    max_tokens: Some(8),
                };
                match tokio::time::timeout(Duration::from_secs(30), client.complete(probe)).await {
                    Ok(Ok(_)) => TestReport {
                        ok: true,
                        message: format!("{} responded", spec.name),
                    },
                    Ok(Err(e)) => TestReport {
                        ok: false,
                        message: e.to_string(),
                    },
                    Err(_) => TestReport {
                        ok: false,
                        message: "probe timed out".into(),
                    },
                }
            }
            Err(e) => TestReport {
                ok: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedClient;
    use ojforge_storage::{CredentialCipher, MemoryRepository};
    use std::collections::BTreeMap;

    fn pool_with_scripted(
        script: Arc<ScriptedClient>,
        gates: Arc<GatePool>,
    ) -> (Arc<LlmPool>, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new(CredentialCipher::from_secret("t")));
        let mut clients: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
        clients.insert("deepseek".to_string(), script);
        let pool = LlmPool::with_clients(gates, Arc::clone(&repo) as Arc<dyn Repository>, clients);
        (pool, repo)
    }

    #[tokio::test]
    async fn call_routes_to_assigned_provider() {
        let gates = GatePool::new(Default::default());
        let script = Arc::new(ScriptedClient::always("hello"));
        let (pool, _repo) = pool_with_scripted(Arc::clone(&script), gates);
        pool.assign_endpoint(LlmEndpoint::Generation, "deepseek").await;

        let cancel = CancellationToken::new();
        let reply = pool
            .call(LlmEndpoint::Generation, "hi", CallOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test]
    async fn ocr_credentials_are_only_needed_on_use() {
        // No siliconflow client wired and no credentials saved: generation
        // still works, OCR fails with an auth error only when invoked.
        let gates = GatePool::new(Default::default());
        let script = Arc::new(ScriptedClient::always("gen.py"));
        let (pool, repo) = pool_with_scripted(script, gates);
        pool.assign_endpoint(LlmEndpoint::Generation, "deepseek").await;

        let cancel = CancellationToken::new();
        assert!(pool
            .call(LlmEndpoint::Generation, "p", CallOptions::default(), &cancel)
            .await
            .is_ok());

        let err = pool
            .call(LlmEndpoint::Ocr, "image", CallOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "auth");
        drop(repo);
    }

    #[tokio::test]
    async fn shape_test_needs_no_client() {
        let gates = GatePool::new(Default::default());
        let repo = Arc::new(MemoryRepository::new(CredentialCipher::from_secret("t")));
        let pool = LlmPool::new(gates, Arc::clone(&repo) as Arc<dyn Repository>, Duration::from_secs(5));

        let report = pool.test("deepseek", false).await;
        assert!(!report.ok);

        let mut creds = BTreeMap::new();
        creds.insert("api_key".to_string(), "sk-test".to_string());
        repo.save_provider_credentials("deepseek", &creds)
            .await
            .unwrap();
        let report = pool.test("deepseek", false).await;
        assert!(report.ok, "{}", report.message);
    }

    #[tokio::test]
    async fn saturated_gate_blocks_until_cancel() {
        let config = ojforge_models::ConcurrencyConfig {
            max_llm_concurrent: 0,
            ..Default::default()
        };
        let gates = GatePool::new(config);
        let script = Arc::new(ScriptedClient::always("x"));
        let (pool, _repo) = pool_with_scripted(script, gates);
        pool.assign_endpoint(LlmEndpoint::Generation, "deepseek").await;

        let cancel = CancellationToken::new();
        let call_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            pool.call(LlmEndpoint::Generation, "p", CallOptions::default(), &call_cancel)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), "cancelled");
    }
}
