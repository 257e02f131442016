//! Backend handlers.
//!
//! A `Handler` receives a fully resolved `StepManifest` and returns an opaque
//! result mapping. `Handler` uses RPITIT and so is not object safe; the
//! `HandlerDyn` / `BoxHandler` pair provides type erasure for the registry:
//! 1. `HandlerDyn` is the object-safe variant with boxed futures
//! 2. every `T: Handler` gets `HandlerDyn` through a blanket impl
//! 3. `BoxHandler` wraps `Box<dyn HandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use jobflow_types::run::StepManifest;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// What a handler returns on success.
pub type HandlerResult = Map<String, Value>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A backend implementation.
pub trait Handler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Execute one manifest. The manifest's idempotency key must be honoured
    /// by backends that perform writes.
    fn execute(
        &self,
        manifest: &StepManifest,
    ) -> impl Future<Output = Result<HandlerResult, HandlerError>> + Send;
}

impl<T: Handler> Handler for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn execute(
        &self,
        manifest: &StepManifest,
    ) -> impl Future<Output = Result<HandlerResult, HandlerError>> + Send {
        (**self).execute(manifest)
    }
}

// ---------------------------------------------------------------------------
// Type erasure
// ---------------------------------------------------------------------------

/// Object-safe version of [`Handler`] with boxed futures.
pub trait HandlerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        manifest: &'a StepManifest,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerResult, HandlerError>> + Send + 'a>>;
}

impl<T: Handler> HandlerDyn for T {
    fn name(&self) -> &str {
        Handler::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        manifest: &'a StepManifest,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerResult, HandlerError>> + Send + 'a>> {
        Box::pin(self.execute(manifest))
    }
}

/// Type-erased handler, as stored in the `HandlerRegistry`.
pub struct BoxHandler {
    inner: Box<dyn HandlerDyn + Send + Sync>,
}

impl BoxHandler {
    pub fn new<T: Handler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, manifest: &StepManifest) -> Result<HandlerResult, HandlerError> {
        self.inner.execute_boxed(manifest).await
    }
}

impl std::fmt::Debug for BoxHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxHandler").field("name", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Side-effect free handler that echoes `{status: "noop", op, params}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, manifest: &StepManifest) -> Result<HandlerResult, HandlerError> {
        let mut out = Map::new();
        out.insert("status".to_string(), json!("noop"));
        out.insert("op".to_string(), json!(manifest.op.as_str()));
        out.insert(
            "params".to_string(),
            Value::Object(manifest.resolved_params.clone()),
        );
        Ok(out)
    }
}

/// A function the callable backend can invoke by name.
pub type CallableFn =
    Arc<dyn Fn(&Map<String, Value>) -> Result<HandlerResult, HandlerError> + Send + Sync>;

/// Callable backend: runs a registered Rust function selected by the
/// `function` param, passing the `args` mapping (empty when absent).
#[derive(Default, Clone)]
pub struct CallableHandler {
    functions: HashMap<String, CallableFn>,
}

impl CallableHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. An existing function with the same name is replaced.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Map<String, Value>) -> Result<HandlerResult, HandlerError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<HandlerResult, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CallableHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableHandler")
            .field("functions", &self.function_names())
            .finish()
    }
}

impl Handler for CallableHandler {
    fn name(&self) -> &str {
        "callable"
    }

    async fn execute(&self, manifest: &StepManifest) -> Result<HandlerResult, HandlerError> {
        let params = &manifest.resolved_params;
        let name = params
            .get("function")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidParams("missing string param 'function'".into()))?;
        let function = self.functions.get(name).ok_or_else(|| {
            HandlerError::failed(
                "unknown_function",
                format!(
                    "no function '{name}' (registered: {})",
                    self.function_names().join(", ")
                ),
            )
        })?;

        let empty = Map::new();
        let args = match params.get("args") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(args)) => args,
            Some(_) => return Err(HandlerError::InvalidParams("'args' must be a mapping".into())),
        };
        tracing::debug!(function = name, step_id = %manifest.step_id, "invoking callable");
        function(args)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
