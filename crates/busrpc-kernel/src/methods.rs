//! Method registry: the methods this process exposes to others.

use busrpc_types::{RpcError, RpcResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Names that collide with the verbs of [`RemoteNode`](crate::RemoteNode).
pub const RESERVED_METHODS: [&str; 3] = ["send", "emit", "call"];

/// Boxed method handler. `Err` carries the failure message.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// A declared method.
#[derive(Clone)]
pub struct Method {
    /// The handler body.
    pub handler: MethodHandler,
    /// Whether a remote invocation gets a response.
    pub responds: bool,
}

impl Method {
    /// Run the handler, substituting the generic execution error for an
    /// empty failure message.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        match (self.handler)(args).await {
            Ok(value) => Ok(value),
            Err(message) if message.is_empty() => Err(execution_error(name)),
            Err(message) => Err(message),
        }
    }
}

/// Message reported when a handler fails without saying why.
pub fn execution_error(name: &str) -> String {
    format!("Method \"{name}\": execution error")
}

/// Table of declared methods. Cloning shares the table.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<RwLock<HashMap<String, Method>>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `name`.
    ///
    /// Fails with [`RpcError::ReservedMethod`] for `send`, `emit` and `call`,
    /// leaving the table untouched.
    pub fn declare<F, Fut>(&self, name: &str, handler: F, responds: bool) -> RpcResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        if RESERVED_METHODS.contains(&name) {
            return Err(RpcError::ReservedMethod(name.to_string()));
        }
        let handler: MethodHandler = Arc::new(move |args| handler(args).boxed());
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        methods.insert(name.to_string(), Method { handler, responds });
        Ok(())
    }

    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<Method> {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods.get(name).cloned()
    }

    /// Name → responds flag for every declared method.
    pub fn snapshot(&self) -> HashMap<String, bool> {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods
            .iter()
            .map(|(name, method)| (name.clone(), method.responds))
            .collect()
    }

    /// Number of declared methods.
    pub fn len(&self) -> usize {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods.len()
    }

    /// Whether no method is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
