//! Handler registry: routes manifests to handlers by backend.
//!
//! Registries are built explicitly and passed to the executor; there is no
//! process-wide default.

use std::collections::HashMap;

use jobflow_types::job::Backend;
use jobflow_types::run::StepManifest;
use thiserror::Error;

use super::handler::{BoxHandler, Handler, HandlerError, HandlerResult, NoopHandler};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(
        "no handler registered for backend '{backend}' (registered: [{}])",
        join_backends(.registered)
    )]
    MissingHandler {
        backend: Backend,
        registered: Vec<Backend>,
    },

    #[error("{backend} handler failed: {source}")]
    Handler {
        backend: Backend,
        source: HandlerError,
    },
}

fn join_backends(backends: &[Backend]) -> String {
    backends
        .iter()
        .map(Backend::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Backend-indexed registry of boxed handlers.
#[derive(Debug)]
pub struct HandlerRegistry {
    handlers: HashMap<Backend, BoxHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Every backend bound to [`NoopHandler`], for dry runs and tests.
    pub fn noop() -> Self {
        let mut registry = Self::new();
        for backend in Backend::ALL {
            registry.register(backend, NoopHandler);
        }
        registry
    }

    /// Registry wired with the provided backend implementations only.
    ///
    /// Backends without an implementation stay unregistered, so dispatching
    /// to them reports a missing handler instead of silently doing nothing.
    pub fn with_handlers(handlers: impl IntoIterator<Item = (Backend, BoxHandler)>) -> Self {
        let mut registry = Self::new();
        for (backend, handler) in handlers {
            registry.register_boxed(backend, handler);
        }
        registry
    }

    /// Register a handler, replacing any existing one for the backend.
    pub fn register<H: Handler + 'static>(&mut self, backend: Backend, handler: H) {
        self.register_boxed(backend, BoxHandler::new(handler));
    }

    pub fn register_boxed(&mut self, backend: Backend, handler: BoxHandler) {
        self.handlers.insert(backend, handler);
    }

    pub fn get(&self, backend: Backend) -> Option<&BoxHandler> {
        self.handlers.get(&backend)
    }

    /// Registered backends in declaration order.
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.handlers.keys().copied().collect();
        backends.sort();
        backends
    }

    /// Forward a manifest to the handler for its backend.
    pub async fn dispatch(&self, manifest: &StepManifest) -> Result<HandlerResult, DispatchError> {
        let backend = manifest.backend;
        let handler = self
            .get(backend)
            .ok_or_else(|| DispatchError::MissingHandler {
                backend,
                registered: self.backends(),
            })?;
        tracing::debug!(
            step_id = %manifest.step_id,
            %backend,
            handler = handler.name(),
            idempotency_key = %manifest.idempotency_key,
            "dispatching manifest"
        );
        handler
            .execute(manifest)
            .await
            .map_err(|source| DispatchError::Handler { backend, source })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::handler::CallableHandler;
    use jobflow_types::job::Op;
    use serde_json::{Map, Value, json};

    fn manifest(op: Op, params: Value) -> StepManifest {
        let Value::Object(resolved_params) = params else {
            panic!("expected object");
        };
        StepManifest {
            run_id: "R1".into(),
            step_id: "s1".into(),
            backend: op.backend(),
            op,
            resolved_params,
            prompt_hash: None,
            idempotency_key: "R1:s1".into(),
            timeout_s: 300,
        }
    }

    #[tokio::test]
    async fn noop_registry_covers_every_backend() {
        let registry = HandlerRegistry::noop();
        assert_eq!(registry.backends(), Backend::ALL.to_vec());
        for op in Op::ALL {
            let out = registry.dispatch(&manifest(op, json!({"x": 1}))).await.unwrap();
            assert_eq!(out["status"], json!("noop"));
            assert_eq!(out["op"], json!(op.as_str()));
        }
    }

    #[tokio::test]
    async fn missing_backend_names_registered_set() {
        let registry = HandlerRegistry::with_handlers([
            (Backend::Orchestration, BoxHandler::new(NoopHandler)),
            (Backend::Storage, BoxHandler::new(NoopHandler)),
        ]);
        let err = registry
            .dispatch(&manifest(Op::LlmComplete, json!({})))
            .await
            .unwrap_err();
        match &err {
            DispatchError::MissingHandler { backend, registered } => {
                assert_eq!(*backend, Backend::Llm);
                assert_eq!(registered, &vec![Backend::Storage, Backend::Orchestration]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            err.to_string(),
            "no handler registered for backend 'llm' (registered: [storage, orchestration])"
        );
    }

    #[tokio::test]
    async fn handler_failures_carry_backend() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            Backend::Callable,
            CallableHandler::new().with_function("fail", |_| {
                Err(HandlerError::failed("quota", "exhausted"))
            }),
        );
        let err = registry
            .dispatch(&manifest(Op::Call, json!({"function": "fail"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler { backend: Backend::Callable, .. }));
        assert_eq!(err.to_string(), "callable handler failed: quota: exhausted");
    }

    #[tokio::test]
    async fn register_replaces_existing() {
        let mut registry = HandlerRegistry::noop();
        registry.register(
            Backend::Callable,
            CallableHandler::new().with_function("one", |_| {
                let mut out = Map::new();
                out.insert("n".into(), json!(1));
                Ok(out)
            }),
        );
        assert_eq!(registry.get(Backend::Callable).unwrap().name(), "callable");
        let out = registry
            .dispatch(&manifest(Op::Call, json!({"function": "one"})))
            .await
            .unwrap();
        assert_eq!(out["n"], json!(1));
    }
}
