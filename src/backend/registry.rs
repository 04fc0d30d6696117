//! Process-wide backend registry
//!
//! Maps registry keys to backend constructors. Populated once at program
//! start (see [`install_defaults`]); later registration under an existing key
//! overwrites, which tests use to install fakes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use tracing::debug;

use crate::backend::{Backend, DockerBackend, DockerConfig, K8sBackend, K8sConfig};
use crate::errors::SandboxError;
use crate::BoxFuture;

/// Async constructor producing a boxed backend
pub type BackendCtor =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn Backend>, SandboxError>> + Send + Sync>;

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, BackendCtor>> = RwLock::new(HashMap::new());
}

/// Insert a constructor under `key`, replacing any previous registration
pub fn register(key: impl Into<String>, ctor: BackendCtor) {
    let key = key.into();
    debug!("registering backend {key}");
    let mut registry = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    registry.insert(key, ctor);
}

/// Look up `key` and construct a backend instance
pub async fn create(key: &str) -> Result<Box<dyn Backend>, SandboxError> {
    let ctor = {
        let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
        registry.get(key).cloned()
    };
    match ctor {
        Some(ctor) => ctor().await,
        None => Err(SandboxError::not_available(key)),
    }
}

/// Registered keys, sorted for stable output
pub fn available() -> Vec<String> {
    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    let mut keys: Vec<String> = registry.keys().cloned().collect();
    keys.sort();
    keys
}

/// Register the two built-in backends under their canonical keys
///
/// Call once at startup, before any session is opened.
pub fn install_defaults() {
    register(
        crate::backend::BackendKind::LocalEngine.as_str(),
        Arc::new(|| {
            Box::pin(async {
                let backend = DockerBackend::connect(DockerConfig::default())?;
                Ok(Box::new(backend) as Box<dyn Backend>)
            })
        }),
    );
    register(
        crate::backend::BackendKind::Orchestrator.as_str(),
        Arc::new(|| {
            Box::pin(async {
                let backend = K8sBackend::connect(K8sConfig::default()).await?;
                Ok(Box::new(backend) as Box<dyn Backend>)
            })
        }),
    );
}
