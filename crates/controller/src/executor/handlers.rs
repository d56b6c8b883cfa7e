//! Remediation handler registry.
//!
//! A handler is a pure planner: it turns the policy's `remediation.params`
//! into a [`Mutation`]. Side effects stay in the [`TargetClient`], so every
//! handler inherits its idempotence.
//!
//! [`TargetClient`]: super::TargetClient

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::ExecutorError;
use crate::crds::RemediationSpec;

/// Corrective operation applied to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Roll the pods by bumping a pod-template annotation
    Restart,
    /// Set the desired replica count
    Scale { replicas: i32 },
}

pub trait RemediationHandler: Send + Sync {
    fn plan(&self, params: &BTreeMap<String, String>) -> Result<Mutation, ExecutorError>;
}

/// Rolling restart. Takes no parameters.
#[derive(Debug, Default)]
pub struct RestartHandler;

impl RemediationHandler for RestartHandler {
    fn plan(&self, _params: &BTreeMap<String, String>) -> Result<Mutation, ExecutorError> {
        Ok(Mutation::Restart)
    }
}

/// Scale to `params.replicas`.
#[derive(Debug, Default)]
pub struct ScaleHandler;

impl RemediationHandler for ScaleHandler {
    fn plan(&self, params: &BTreeMap<String, String>) -> Result<Mutation, ExecutorError> {
        let invalid = |reason: String| ExecutorError::InvalidParams {
            handler: "scale".to_string(),
            reason,
        };
        let raw = params
            .get("replicas")
            .ok_or_else(|| invalid("missing 'replicas'".to_string()))?;
        let replicas: i32 = raw
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'replicas' is not an integer: {raw}")))?;
        if replicas < 0 {
            return Err(invalid(format!("'replicas' must not be negative: {replicas}")));
        }
        Ok(Mutation::Scale { replicas })
    }
}

#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RemediationHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with `restart` and `scale`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("restart", RestartHandler);
        registry.register("scale", ScaleHandler);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl RemediationHandler + 'static,
    ) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn plan(&self, remediation: &RemediationSpec) -> Result<Mutation, ExecutorError> {
        self.handlers
            .get(&remediation.handler)
            .ok_or_else(|| ExecutorError::UnknownHandler(remediation.handler.clone()))?
            .plan(&remediation.params)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remediation(handler: &str, params: &[(&str, &str)]) -> RemediationSpec {
        RemediationSpec {
            handler: handler.to_string(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_builtins() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["restart", "scale"]);
        assert_eq!(
            registry.plan(&remediation("restart", &[])).unwrap(),
            Mutation::Restart
        );
        assert_eq!(
            registry.plan(&remediation("scale", &[("replicas", "5")])).unwrap(),
            Mutation::Scale { replicas: 5 }
        );
    }

    #[test]
    fn test_scale_params_are_checked() {
        let registry = HandlerRegistry::with_builtins();
        for params in [&[][..], &[("replicas", "many")][..], &[("replicas", "-1")][..]] {
            let err = registry.plan(&remediation("scale", params)).unwrap_err();
            assert!(matches!(err, ExecutorError::InvalidParams { .. }));
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn test_unknown_handler_is_fatal() {
        let err = HandlerRegistry::with_builtins()
            .plan(&remediation("page-oncall", &[]))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownHandler(ref h) if h == "page-oncall"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_custom_handler() {
        struct ScaleToZero;
        impl RemediationHandler for ScaleToZero {
            fn plan(&self, _: &BTreeMap<String, String>) -> Result<Mutation, ExecutorError> {
                Ok(Mutation::Scale { replicas: 0 })
            }
        }

        let mut registry = HandlerRegistry::with_builtins();
        registry.register("quarantine", ScaleToZero);
        assert_eq!(
            registry.plan(&remediation("quarantine", &[])).unwrap(),
            Mutation::Scale { replicas: 0 }
        );
    }
}
