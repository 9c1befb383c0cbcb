//! The method registry: named RPC handlers with optional middleware,
//! schema validation, result caching and a per-call timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::context::CallContext;
use crate::errors::DispatchError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;
pub type Handler = Arc<dyn Fn(CallContext, Value) -> HandlerFuture + Send + Sync>;

pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;
pub type Middleware = Arc<dyn Fn(Value) -> MiddlewareFuture + Send + Sync>;

pub type SchemaValidator = Arc<dyn Fn(&Value) -> Result<(), Value> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MethodOptions {
    pub protected: bool,
    pub middleware: Vec<Middleware>,
    pub schema: Option<SchemaValidator>,
    pub cache_ttl: Option<Duration>,
    pub timeout: Option<Duration>,
}

pub struct MethodDef {
    pub name: String,
    pub handler: Handler,
    pub protected: bool,
    pub middleware: Vec<Middleware>,
    pub schema: Option<SchemaValidator>,
    pub cache_ttl: Option<Duration>,
    pub timeout: Option<Duration>,
}

#[derive(Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub protected: bool,
    pub has_schema: bool,
    pub cache_ttl_ms: Option<u128>,
    pub timeout_ms: Option<u128>,
}

pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<MethodDef>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        MethodRegistry {
            methods: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_method(&self, name: impl Into<String>, handler: Handler, options: MethodOptions) {
        let name = name.into();
        let def = Arc::new(MethodDef {
            name: name.clone(),
            handler,
            protected: options.protected,
            middleware: options.middleware,
            schema: options.schema,
            cache_ttl: options.cache_ttl,
            timeout: options.timeout,
        });
        self.methods.write().await.insert(name, def);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<MethodDef>> {
        self.methods.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<MethodInfo> {
        let methods = self.methods.read().await;
        let mut infos: Vec<MethodInfo> = methods
            .values()
            .map(|def| MethodInfo {
                name: def.name.clone(),
                protected: def.protected,
                has_schema: def.schema.is_some(),
                cache_ttl_ms: def.cache_ttl.map(|d| d.as_millis()),
                timeout_ms: def.timeout.map(|d| d.as_millis()),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}
