//! Process-local configuration map and API-key resolution.
//!
//! `AgentEnvironment` is a write-at-startup, read-thereafter map that
//! shadows OS environment variables, useful for tests and for embedding
//! hosts that do not want credentials in the process environment.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

static ENVIRONMENT: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn map() -> &'static RwLock<HashMap<String, String>> {
    ENVIRONMENT.get_or_init(|| RwLock::new(HashMap::new()))
}

pub struct AgentEnvironment;

impl AgentEnvironment {
    pub fn set(key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut env) = map().write() {
            env.insert(key.into(), value.into());
        }
    }

    pub fn get(key: &str) -> Option<String> {
        map().read().ok().and_then(|env| env.get(key).cloned())
    }

    pub fn remove(key: &str) {
        if let Ok(mut env) = map().write() {
            env.remove(key);
        }
    }

    pub fn clear() {
        if let Ok(mut env) = map().write() {
            env.clear();
        }
    }
}

/// Resolve an API key with the documented precedence: explicit parameter,
/// then [`AgentEnvironment`], then the OS variable named by the provider.
/// Providers with no key name (local servers) resolve to `None`; everyone
/// else fails with a configuration error when nothing is found.
pub(crate) fn resolve_api_key(
    explicit: Option<&str>,
    key_name: Option<&str>,
    provider: &str,
) -> Result<Option<String>> {
    if let Some(key) = explicit {
        if !key.is_empty() {
            return Ok(Some(key.to_string()));
        }
    }

    let Some(name) = key_name else {
        return Ok(None);
    };

    if let Some(value) = AgentEnvironment::get(name) {
        if !value.is_empty() {
            return Ok(Some(value));
        }
    }

    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            return Ok(Some(value));
        }
    }

    Err(Error::configuration(format!(
        "missing API key for provider '{}': set {} or pass an explicit key",
        provider, name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_key_wins() {
        AgentEnvironment::set("TEST_EXPLICIT_KEY", "from-env");
        let key = resolve_api_key(Some("from-param"), Some("TEST_EXPLICIT_KEY"), "test").unwrap();
        assert_eq!(key.as_deref(), Some("from-param"));
        AgentEnvironment::remove("TEST_EXPLICIT_KEY");
    }

    #[test]
    fn test_agent_environment_beats_os_env() {
        AgentEnvironment::set("TEST_AGENT_ENV_KEY", "agent-value");
        let key = resolve_api_key(None, Some("TEST_AGENT_ENV_KEY"), "test").unwrap();
        assert_eq!(key.as_deref(), Some("agent-value"));
        AgentEnvironment::remove("TEST_AGENT_ENV_KEY");
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let err = resolve_api_key(None, Some("TEST_DEFINITELY_UNSET_KEY"), "test").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("TEST_DEFINITELY_UNSET_KEY"));
    }

    #[test]
    fn test_keyless_provider_resolves_to_none() {
        let key = resolve_api_key(None, None, "ollama").unwrap();
        assert!(key.is_none());
    }
}
