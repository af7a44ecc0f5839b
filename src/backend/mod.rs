//! The automation backend seam.
//!
//! The engine never talks to UI automation directly; it drives an
//! [`AutomationBackend`], which may be a local session or a remote one
//! behind the RPC transport ([`crate::rpc::RemoteBackend`]).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::TransportError;

/// Opaque element-reference key handed out by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementRef(pub String);

impl ElementRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Search criteria for `find` and `wait_for_enabled`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl FindCriteria {
    pub fn is_empty(&self) -> bool {
        self.automation_id.is_none()
            && self.name.is_none()
            && self.control_type.is_none()
            && self.class_name.is_none()
    }
}

impl fmt::Display for FindCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = &self.automation_id {
            parts.push(format!("automation_id={}", v));
        }
        if let Some(v) = &self.name {
            parts.push(format!("name={}", v));
        }
        if let Some(v) = &self.control_type {
            parts.push(format!("control_type={}", v));
        }
        if let Some(v) = &self.class_name {
            parts.push(format!("class_name={}", v));
        }
        if parts.is_empty() {
            f.write_str("<no criteria>")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Error reported by a backend operation.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        Self(err.to_string())
    }
}

impl From<BackendError> for crate::types::StepError {
    fn from(err: BackendError) -> Self {
        crate::types::StepError::Backend(err.0)
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The capability set the executor consumes. Mirrors the session owned by
/// the (possibly more privileged) automation process.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    async fn attach(&self, process_name: Option<&str>, pid: Option<u32>) -> BackendResult<()>;
    async fn find(&self, criteria: &FindCriteria) -> BackendResult<Option<ElementRef>>;
    async fn find_by_path(&self, path: &str) -> BackendResult<Option<ElementRef>>;
    async fn click(&self, target: &ElementRef) -> BackendResult<()>;
    async fn right_click(&self, target: &ElementRef) -> BackendResult<()>;
    async fn type_text(&self, text: &str) -> BackendResult<()>;
    async fn send_keys(&self, keys: &str) -> BackendResult<()>;
    async fn set_value(&self, target: &ElementRef, value: &str) -> BackendResult<()>;
    async fn get_value(&self, target: Option<&ElementRef>) -> BackendResult<String>;
    async fn read_property(&self, target: &ElementRef, name: &str) -> BackendResult<String>;
    async fn get_children(&self, target: Option<&ElementRef>) -> BackendResult<Vec<ElementRef>>;
    async fn focus(&self) -> BackendResult<()>;
    async fn snapshot(&self, depth: Option<u32>) -> BackendResult<String>;
    async fn screenshot(&self) -> BackendResult<Vec<u8>>;
    #[allow(clippy::too_many_arguments)]
    async fn launch_and_attach(
        &self,
        path: &str,
        args: Option<&str>,
        working_dir: Option<&str>,
        if_not_running: bool,
        timeout: Duration,
    ) -> BackendResult<()>;
    async fn wait_for_window_ready(
        &self,
        title_contains: &str,
        timeout: Duration,
    ) -> BackendResult<()>;
    async fn is_attached(&self) -> BackendResult<bool>;
    async fn is_enabled(&self, target: &ElementRef) -> BackendResult<bool>;
}

/// Synchronized element-reference cache for backend implementations.
/// Add and get are independently locked; the cache is not part of any
/// larger transaction.
#[derive(Debug, Default, Clone)]
pub struct RefCache {
    inner: Arc<DashMap<String, ElementRef>>,
    next_id: Arc<AtomicU64>,
}

impl RefCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle under a fresh generated key and return the key.
    pub fn insert(&self, handle: ElementRef) -> String {
        let key = format!("el-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.insert(key.clone(), handle);
        key
    }

    pub fn add(&self, key: impl Into<String>, handle: ElementRef) {
        self.inner.insert(key.into(), handle);
    }

    pub fn get(&self, key: &str) -> Option<ElementRef> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_display_lists_set_fields() {
        let criteria = FindCriteria {
            automation_id: Some("okButton".to_string()),
            control_type: Some("Button".to_string()),
            ..Default::default()
        };
        let shown = criteria.to_string();
        assert!(shown.contains("automation_id=okButton"));
        assert!(shown.contains("control_type=Button"));
        assert!(!shown.contains("name="));
    }

    #[test]
    fn test_empty_criteria() {
        assert!(FindCriteria::default().is_empty());
        assert_eq!(FindCriteria::default().to_string(), "<no criteria>");
    }

    #[test]
    fn test_ref_cache_generated_keys() {
        let cache = RefCache::new();
        let k1 = cache.insert(ElementRef::new("win32:0x1234"));
        let k2 = cache.insert(ElementRef::new("win32:0x5678"));
        assert_ne!(k1, k2);
        assert_eq!(cache.get(&k1), Some(ElementRef::new("win32:0x1234")));
        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
