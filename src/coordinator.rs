//! Tool-call identity across providers with heterogeneous ID semantics.
//!
//! OpenAI-family providers mint their own call IDs; Gemini emits bare
//! function calls and expects responses paired by function name. The
//! coordinator owns both regimes: provider IDs are used verbatim when
//! present, synthesized otherwise, and a per-name FIFO queue pairs
//! results to the oldest outstanding call when no ID is available.

use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ToolIdCoordinator {
    /// id -> tool name
    outstanding: HashMap<String, String>,
    /// tool name -> outstanding ids, oldest first
    queues: HashMap<String, VecDeque<String>>,
}

impl ToolIdCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call in the outstanding set and return its id, minting one
    /// when the provider supplied none.
    pub fn register_call(&mut self, id: Option<&str>, name: &str) -> String {
        let id = match id {
            Some(provided) if !provided.is_empty() => provided.to_string(),
            _ => synthesize_id(),
        };
        self.outstanding.insert(id.clone(), name.to_string());
        self.queues
            .entry(name.to_string())
            .or_default()
            .push_back(id.clone());
        id
    }

    /// True iff `id` refers to an outstanding call
    pub fn validate_result(&self, id: &str) -> bool {
        self.outstanding.contains_key(id)
    }

    /// Pop the oldest outstanding call for `name`
    pub fn match_by_name_fifo(&mut self, name: &str) -> Result<String> {
        let id = self
            .queues
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| Error::NoMatchingCall(name.to_string()))?;
        self.outstanding.remove(&id);
        Ok(id)
    }

    /// Settle an outstanding call by id. Returns false if it was unknown.
    pub fn consume(&mut self, id: &str) -> bool {
        match self.outstanding.remove(id) {
            Some(name) => {
                if let Some(queue) = self.queues.get_mut(&name) {
                    queue.retain(|queued| queued != id);
                }
                true
            }
            None => false,
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Reset for a new conversation
    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.queues.clear();
    }
}

/// Mint a call id unique within the process
pub fn synthesize_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_keeps_provider_id() {
        let mut coordinator = ToolIdCoordinator::new();
        let id = coordinator.register_call(Some("call_abc"), "weather");
        assert_eq!(id, "call_abc");
        assert!(coordinator.validate_result("call_abc"));
    }

    #[test]
    fn test_register_synthesizes_when_missing() {
        let mut coordinator = ToolIdCoordinator::new();
        let a = coordinator.register_call(None, "weather");
        let b = coordinator.register_call(Some(""), "weather");
        assert!(!a.is_empty());
        assert!(!b.is_empty());
        assert_ne!(a, b);
        assert!(coordinator.validate_result(&a));
        assert!(coordinator.validate_result(&b));
    }

    #[test]
    fn test_fifo_returns_oldest_first() {
        let mut coordinator = ToolIdCoordinator::new();
        let first = coordinator.register_call(None, "weather");
        let second = coordinator.register_call(None, "weather");
        coordinator.register_call(None, "temperature");

        assert_eq!(coordinator.match_by_name_fifo("weather").unwrap(), first);
        assert_eq!(coordinator.match_by_name_fifo("weather").unwrap(), second);
        assert!(matches!(
            coordinator.match_by_name_fifo("weather"),
            Err(Error::NoMatchingCall(name)) if name == "weather"
        ));
        assert_eq!(coordinator.outstanding_count(), 1);
    }

    #[test]
    fn test_fifo_fails_for_unknown_name() {
        let mut coordinator = ToolIdCoordinator::new();
        assert!(matches!(
            coordinator.match_by_name_fifo("nope"),
            Err(Error::NoMatchingCall(_))
        ));
    }

    #[test]
    fn test_consume_removes_from_queue() {
        let mut coordinator = ToolIdCoordinator::new();
        let first = coordinator.register_call(None, "weather");
        let second = coordinator.register_call(None, "weather");

        assert!(coordinator.consume(&first));
        assert!(!coordinator.consume(&first));
        // FIFO must now skip the consumed id
        assert_eq!(coordinator.match_by_name_fifo("weather").unwrap(), second);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut coordinator = ToolIdCoordinator::new();
        coordinator.register_call(None, "weather");
        coordinator.clear();
        assert!(coordinator.is_empty());
        assert!(coordinator.match_by_name_fifo("weather").is_err());
    }
}
