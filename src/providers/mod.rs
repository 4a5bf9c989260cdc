//! Provider registry: the static table of known backends, alias
//! resolution, capability declarations and model-string parsing.
//!
//! The registry is process-wide and read-mostly: it is seeded with the
//! built-in table on first access and supports dynamic registration, but
//! is never mutated per request.

use crate::environment::resolve_api_key;
use crate::error::{Error, Result};
use crate::model::{ChatModel, ChatModelOptions, EmbeddingsModel, EmbeddingsModelOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "google")]
pub mod google;
#[cfg(feature = "openai")]
pub mod openai;

/// Informational feature tags. Never enforced at runtime; used for test
/// filtering and caller feature-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    Embeddings,
    MultiToolCalls,
    TypedOutput,
    TypedOutputWithTools,
    Vision,
}

/// Wire family a provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFamily {
    #[cfg(feature = "openai")]
    OpenAi,
    #[cfg(feature = "anthropic")]
    Anthropic,
    #[cfg(feature = "google")]
    Google,
}

/// Default model names a provider advertises
#[derive(Debug, Clone, Default)]
pub struct DefaultModels {
    pub chat: String,
    pub embeddings: Option<String>,
}

/// A model id returned by [`Provider::list_models`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
}

/// A named backend: identity, configuration defaults, capabilities and
/// factory methods for its models.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    /// Environment variable holding the API key; `None` for local servers
    pub api_key_name: Option<String>,
    pub base_url: String,
    pub default_models: DefaultModels,
    pub capabilities: Vec<Capability>,
    pub wire_family: WireFamily,
}

impl Provider {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn resolve_key(&self, explicit: Option<&str>) -> Result<Option<String>> {
        resolve_api_key(explicit, self.api_key_name.as_deref(), &self.name)
    }

    /// Construct a chat model. API-key resolution happens here, lazily,
    /// so an agent can be created without credentials present.
    pub fn create_chat_model(&self, options: ChatModelOptions) -> Result<Box<dyn ChatModel>> {
        let api_key = self.resolve_key(options.api_key.as_deref())?;
        match self.wire_family {
            #[cfg(feature = "openai")]
            WireFamily::OpenAi => Ok(Box::new(openai::OpenAiChatModel::new(
                self, options, api_key,
            ))),
            #[cfg(feature = "anthropic")]
            WireFamily::Anthropic => {
                let api_key = api_key.ok_or_else(|| {
                    Error::configuration(format!("provider '{}' requires an API key", self.name))
                })?;
                Ok(Box::new(anthropic::AnthropicChatModel::new(
                    self, options, api_key,
                )))
            }
            #[cfg(feature = "google")]
            WireFamily::Google => {
                let api_key = api_key.ok_or_else(|| {
                    Error::configuration(format!("provider '{}' requires an API key", self.name))
                })?;
                Ok(Box::new(google::GoogleChatModel::new(
                    self, options, api_key,
                )?))
            }
        }
    }

    pub fn create_embeddings_model(
        &self,
        options: EmbeddingsModelOptions,
    ) -> Result<Box<dyn EmbeddingsModel>> {
        let model_name = options
            .model_name
            .clone()
            .or_else(|| self.default_models.embeddings.clone())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "provider '{}' has no embeddings model",
                    self.name
                ))
            })?;
        let api_key = self.resolve_key(options.api_key.as_deref())?;
        match self.wire_family {
            #[cfg(feature = "openai")]
            WireFamily::OpenAi => Ok(Box::new(openai::OpenAiEmbeddingsModel::new(
                self, options, model_name, api_key,
            ))),
            #[cfg(feature = "google")]
            WireFamily::Google => {
                let api_key = api_key.ok_or_else(|| {
                    Error::configuration(format!("provider '{}' requires an API key", self.name))
                })?;
                Ok(Box::new(google::GoogleEmbeddingsModel::new(
                    self, options, model_name, api_key,
                )))
            }
            #[allow(unreachable_patterns)]
            _ => Err(Error::configuration(format!(
                "provider '{}' does not support embeddings",
                self.name
            ))),
        }
    }

    /// List the models the backend advertises
    pub async fn list_models(&self, api_key: Option<&str>) -> Result<Vec<ModelInfo>> {
        let api_key = self.resolve_key(api_key)?;
        match self.wire_family {
            #[cfg(feature = "openai")]
            WireFamily::OpenAi => openai::list_models(&self.base_url, api_key.as_deref()).await,
            #[cfg(feature = "anthropic")]
            WireFamily::Anthropic => {
                let key = api_key.ok_or_else(|| {
                    Error::configuration(format!("provider '{}' requires an API key", self.name))
                })?;
                anthropic::list_models(&self.base_url, &key).await
            }
            #[cfg(feature = "google")]
            WireFamily::Google => {
                let key = api_key.ok_or_else(|| {
                    Error::configuration(format!("provider '{}' requires an API key", self.name))
                })?;
                google::list_models(&self.base_url, &key).await
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<Provider>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<Provider>>> {
    REGISTRY.get_or_init(|| {
        let mut table = HashMap::new();
        for provider in builtin_providers() {
            table.insert(provider.name.clone(), Arc::new(provider));
        }
        RwLock::new(table)
    })
}

/// Entry points to the process-wide provider table
pub struct Providers;

impl Providers {
    /// Look up a provider by name or alias (case-insensitive)
    pub fn get(name: &str) -> Result<Arc<Provider>> {
        let wanted = name.to_ascii_lowercase();
        let table = registry()
            .read()
            .map_err(|_| Error::configuration("provider registry poisoned"))?;
        if let Some(provider) = table.get(&wanted) {
            return Ok(Arc::clone(provider));
        }
        for provider in table.values() {
            if provider.aliases.iter().any(|alias| alias == &wanted) {
                return Ok(Arc::clone(provider));
            }
        }
        Err(Error::configuration(format!("unknown provider '{}'", name)))
    }

    /// Register or replace a provider at runtime
    pub fn register(provider: Provider) {
        if let Ok(mut table) = registry().write() {
            table.insert(provider.name.clone(), Arc::new(provider));
        }
    }

    pub fn all() -> Vec<Arc<Provider>> {
        registry()
            .read()
            .map(|table| {
                let mut providers: Vec<_> = table.values().cloned().collect();
                providers.sort_by(|a, b| a.name.cmp(&b.name));
                providers
            })
            .unwrap_or_default()
    }

    /// Providers whose capability set is a superset of `capabilities`
    pub fn all_with(capabilities: &[Capability]) -> Vec<Arc<Provider>> {
        Self::all()
            .into_iter()
            .filter(|provider| {
                capabilities
                    .iter()
                    .all(|capability| provider.has_capability(*capability))
            })
            .collect()
    }
}

fn builtin_providers() -> Vec<Provider> {
    use Capability::*;

    let mut providers = Vec::new();

    #[cfg(feature = "openai")]
    {
        providers.push(Provider {
            name: "openai".to_string(),
            display_name: "OpenAI".to_string(),
            aliases: vec!["gpt".to_string()],
            api_key_name: Some("OPENAI_API_KEY".to_string()),
            base_url: "https://api.openai.com/v1".to_string(),
            default_models: DefaultModels {
                chat: "gpt-4o".to_string(),
                embeddings: Some("text-embedding-3-small".to_string()),
            },
            capabilities: vec![
                Chat,
                Embeddings,
                MultiToolCalls,
                TypedOutput,
                TypedOutputWithTools,
                Vision,
            ],
            wire_family: WireFamily::OpenAi,
        });
        providers.push(Provider {
            name: "openrouter".to_string(),
            display_name: "OpenRouter".to_string(),
            aliases: Vec::new(),
            api_key_name: Some("OPENROUTER_API_KEY".to_string()),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            default_models: DefaultModels {
                chat: "openai/gpt-4o".to_string(),
                embeddings: None,
            },
            capabilities: vec![Chat, MultiToolCalls, TypedOutput, TypedOutputWithTools, Vision],
            wire_family: WireFamily::OpenAi,
        });
        providers.push(Provider {
            name: "together".to_string(),
            display_name: "Together AI".to_string(),
            aliases: Vec::new(),
            api_key_name: Some("TOGETHER_API_KEY".to_string()),
            base_url: "https://api.together.xyz/v1".to_string(),
            default_models: DefaultModels {
                chat: "meta-llama/Llama-3.3-70B-Instruct-Turbo".to_string(),
                embeddings: None,
            },
            capabilities: vec![Chat, MultiToolCalls],
            wire_family: WireFamily::OpenAi,
        });
        providers.push(Provider {
            name: "mistral".to_string(),
            display_name: "Mistral AI".to_string(),
            aliases: Vec::new(),
            api_key_name: Some("MISTRAL_API_KEY".to_string()),
            base_url: "https://api.mistral.ai/v1".to_string(),
            default_models: DefaultModels {
                chat: "mistral-large-latest".to_string(),
                embeddings: Some("mistral-embed".to_string()),
            },
            capabilities: vec![Chat, Embeddings, MultiToolCalls, TypedOutput],
            wire_family: WireFamily::OpenAi,
        });
        providers.push(Provider {
            name: "cohere".to_string(),
            display_name: "Cohere".to_string(),
            aliases: Vec::new(),
            api_key_name: Some("COHERE_API_KEY".to_string()),
            base_url: "https://api.cohere.ai/compatibility/v1".to_string(),
            default_models: DefaultModels {
                chat: "command-r-plus".to_string(),
                embeddings: Some("embed-v4.0".to_string()),
            },
            capabilities: vec![Chat, Embeddings, MultiToolCalls],
            wire_family: WireFamily::OpenAi,
        });
        providers.push(Provider {
            name: "ollama".to_string(),
            display_name: "Ollama".to_string(),
            aliases: Vec::new(),
            api_key_name: None,
            base_url: "http://localhost:11434/v1".to_string(),
            default_models: DefaultModels {
                chat: "llama3.2".to_string(),
                embeddings: Some("nomic-embed-text".to_string()),
            },
            capabilities: vec![Chat, Embeddings, MultiToolCalls],
            wire_family: WireFamily::OpenAi,
        });
    }

    #[cfg(feature = "anthropic")]
    providers.push(Provider {
        name: "anthropic".to_string(),
        display_name: "Anthropic".to_string(),
        aliases: vec!["claude".to_string()],
        api_key_name: Some("ANTHROPIC_API_KEY".to_string()),
        base_url: "https://api.anthropic.com/v1".to_string(),
        default_models: DefaultModels {
            chat: "claude-sonnet-4-5-20250929".to_string(),
            embeddings: None,
        },
        capabilities: vec![Chat, MultiToolCalls, Vision],
        wire_family: WireFamily::Anthropic,
    });

    #[cfg(feature = "google")]
    providers.push(Provider {
        name: "google".to_string(),
        display_name: "Google Gemini".to_string(),
        aliases: vec!["gemini".to_string(), "googleai".to_string()],
        api_key_name: Some("GEMINI_API_KEY".to_string()),
        base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        default_models: DefaultModels {
            chat: "gemini-2.0-flash".to_string(),
            embeddings: Some("text-embedding-004".to_string()),
        },
        capabilities: vec![Chat, Embeddings, MultiToolCalls, TypedOutput, Vision],
        wire_family: WireFamily::Google,
    });

    providers
}

// ============================================================================
// Model strings
// ============================================================================

/// A parsed model string.
///
/// Grammar: `provider`, `provider:name`, `provider/path` (the path may
/// itself contain `/`), or `provider?chat=..&embeddings=..&other=..`.
/// The provider segment is lowercased; model names are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: String,
    pub chat: Option<String>,
    pub embeddings: Option<String>,
    pub other: Option<String>,
}

impl ModelSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::configuration("empty model string"));
        }

        let split_at = input.find(|c| c == ':' || c == '/' || c == '?');
        let Some(pos) = split_at else {
            return Ok(Self::provider_only(input));
        };

        let provider = input[..pos].to_ascii_lowercase();
        if provider.is_empty() {
            return Err(Error::configuration(format!(
                "model string '{}' has no provider segment",
                input
            )));
        }
        let separator = input.as_bytes()[pos] as char;
        let rest = &input[pos + 1..];

        match separator {
            ':' | '/' => {
                if rest.is_empty() {
                    return Err(Error::configuration(format!(
                        "model string '{}' has an empty model name",
                        input
                    )));
                }
                Ok(ModelSpec {
                    provider,
                    chat: Some(rest.to_string()),
                    embeddings: None,
                    other: None,
                })
            }
            _ => {
                let mut spec = Self::provider_only(&provider);
                for pair in rest.split('&').filter(|pair| !pair.is_empty()) {
                    let (key, value) = pair.split_once('=').ok_or_else(|| {
                        Error::configuration(format!(
                            "malformed query pair '{}' in model string '{}'",
                            pair, input
                        ))
                    })?;
                    match key {
                        "chat" => spec.chat = Some(value.to_string()),
                        "embeddings" => spec.embeddings = Some(value.to_string()),
                        "other" => spec.other = Some(value.to_string()),
                        _ => {
                            return Err(Error::configuration(format!(
                                "unknown model-string key '{}' (expected chat, embeddings or other)",
                                key
                            )))
                        }
                    }
                }
                Ok(spec)
            }
        }
    }

    fn provider_only(provider: &str) -> Self {
        ModelSpec {
            provider: provider.to_ascii_lowercase(),
            chat: None,
            embeddings: None,
            other: None,
        }
    }
}

impl FromStr for ModelSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_only() {
        let spec = ModelSpec::parse("OpenAI").unwrap();
        assert_eq!(spec.provider, "openai");
        assert!(spec.chat.is_none());
    }

    #[test]
    fn test_parse_colon_form() {
        let spec = ModelSpec::parse("openai:gpt-4o").unwrap();
        assert_eq!(spec.provider, "openai");
        assert_eq!(spec.chat.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_parse_slash_form_keeps_full_path() {
        let spec = ModelSpec::parse("openrouter/openai/gpt-4o").unwrap();
        assert_eq!(spec.provider, "openrouter");
        assert_eq!(spec.chat.as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn test_parse_query_form() {
        let spec =
            ModelSpec::parse("openai?chat=gpt-4o&embeddings=text-embedding-3-large").unwrap();
        assert_eq!(spec.provider, "openai");
        assert_eq!(spec.chat.as_deref(), Some("gpt-4o"));
        assert_eq!(spec.embeddings.as_deref(), Some("text-embedding-3-large"));
        assert!(spec.other.is_none());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ModelSpec::parse("").is_err());
        assert!(ModelSpec::parse("openai:").is_err());
        assert!(ModelSpec::parse(":gpt-4o").is_err());
        assert!(ModelSpec::parse("openai?bogus=x").is_err());
        assert!(ModelSpec::parse("openai?chat").is_err());
    }

    #[test]
    fn test_registry_alias_resolution() {
        #[cfg(feature = "anthropic")]
        assert_eq!(Providers::get("claude").unwrap().name, "anthropic");
        #[cfg(feature = "google")]
        assert_eq!(Providers::get("Gemini").unwrap().name, "google");
        assert!(Providers::get("definitely-not-a-provider").is_err());
    }

    #[test]
    #[cfg(feature = "openai")]
    fn test_all_with_filters_capabilities() {
        let typed = Providers::all_with(&[Capability::TypedOutput, Capability::TypedOutputWithTools]);
        assert!(typed.iter().any(|p| p.name == "openai"));
        assert!(!typed.iter().any(|p| p.name == "cohere"));
    }

    #[test]
    #[cfg(feature = "openai")]
    fn test_ollama_has_no_key_name() {
        let ollama = Providers::get("ollama").unwrap();
        assert!(ollama.api_key_name.is_none());
    }

    #[test]
    fn test_dynamic_registration() {
        #[cfg(feature = "openai")]
        {
            let mut custom = (*Providers::get("openai").unwrap()).clone();
            custom.name = "custom-proxy".to_string();
            custom.aliases = vec!["proxy".to_string()];
            custom.base_url = "http://localhost:8080/v1".to_string();
            Providers::register(custom);

            assert_eq!(Providers::get("proxy").unwrap().name, "custom-proxy");
        }
    }
}
