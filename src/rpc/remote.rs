//! [`AutomationBackend`] over an [`RpcClient`], so the executor can drive
//! a session owned by another process without knowing the difference.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::{AutomationBackend, BackendError, BackendResult, ElementRef, FindCriteria};
use crate::rpc::client::RpcClient;
use crate::types::TransportError;

/// Remote automation session. Per-call deadline is optional; without one
/// every call inherits the client gate's liveness contract.
pub struct RemoteBackend {
    client: Arc<RpcClient>,
    call_timeout: Option<Duration>,
}

impl RemoteBackend {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            call_timeout: None,
        }
    }

    /// Bound every call by `timeout` on top of the server's own limits.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    fn deadline(&self, floor: Option<Duration>) -> Option<Instant> {
        let timeout = match (self.call_timeout, floor) {
            (Some(own), Some(floor)) => Some(own.max(floor)),
            (Some(own), None) => Some(own),
            (None, Some(floor)) => Some(floor),
            (None, None) => None,
        };
        timeout.map(|t| Instant::now() + t)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Value,
        floor: Option<Duration>,
    ) -> BackendResult<T> {
        let result = self
            .client
            .call(method, args, self.deadline(floor))
            .await
            .map_err(remote_fault)?;
        serde_json::from_value(result).map_err(|e| {
            BackendError::new(format!("bad '{}' result from peer: {}", method, e))
        })
    }

    async fn call_unit(&self, method: &str, args: Value) -> BackendResult<()> {
        self.client
            .call(method, args, self.deadline(None))
            .await
            .map_err(remote_fault)?;
        Ok(())
    }
}

/// Keep the remote's own message; wrap only genuine transport faults.
fn remote_fault(err: TransportError) -> BackendError {
    match err {
        TransportError::Remote { message } => BackendError::new(message),
        other => BackendError::from(other),
    }
}

#[async_trait]
impl AutomationBackend for RemoteBackend {
    async fn attach(&self, process_name: Option<&str>, pid: Option<u32>) -> BackendResult<()> {
        self.call_unit("attach", json!({ "process_name": process_name, "pid": pid }))
            .await
    }

    async fn find(&self, criteria: &FindCriteria) -> BackendResult<Option<ElementRef>> {
        self.call("find", json!(criteria), None).await
    }

    async fn find_by_path(&self, path: &str) -> BackendResult<Option<ElementRef>> {
        self.call("find_by_path", json!({ "path": path }), None).await
    }

    async fn click(&self, target: &ElementRef) -> BackendResult<()> {
        self.call_unit("click", json!({ "ref": target })).await
    }

    async fn right_click(&self, target: &ElementRef) -> BackendResult<()> {
        self.call_unit("right_click", json!({ "ref": target })).await
    }

    async fn type_text(&self, text: &str) -> BackendResult<()> {
        self.call_unit("type_text", json!({ "text": text })).await
    }

    async fn send_keys(&self, keys: &str) -> BackendResult<()> {
        self.call_unit("send_keys", json!({ "keys": keys })).await
    }

    async fn set_value(&self, target: &ElementRef, value: &str) -> BackendResult<()> {
        self.call_unit("set_value", json!({ "ref": target, "value": value }))
            .await
    }

    async fn get_value(&self, target: Option<&ElementRef>) -> BackendResult<String> {
        self.call("get_value", json!({ "ref": target }), None).await
    }

    async fn read_property(&self, target: &ElementRef, name: &str) -> BackendResult<String> {
        self.call("read_property", json!({ "ref": target, "name": name }), None)
            .await
    }

    async fn get_children(&self, target: Option<&ElementRef>) -> BackendResult<Vec<ElementRef>> {
        self.call("get_children", json!({ "ref": target }), None).await
    }

    async fn focus(&self) -> BackendResult<()> {
        self.call_unit("focus", json!({})).await
    }

    async fn snapshot(&self, depth: Option<u32>) -> BackendResult<String> {
        self.call("snapshot", json!({ "depth": depth }), None).await
    }

    async fn screenshot(&self) -> BackendResult<Vec<u8>> {
        self.call("screenshot", json!({}), None).await
    }

    async fn launch_and_attach(
        &self,
        path: &str,
        args: Option<&str>,
        working_dir: Option<&str>,
        if_not_running: bool,
        timeout: Duration,
    ) -> BackendResult<()> {
        // the peer needs at least as long as the launch itself
        self.call(
            "launch_and_attach",
            json!({
                "path": path,
                "args": args,
                "working_dir": working_dir,
                "if_not_running": if_not_running,
                "timeout_secs": timeout.as_secs(),
            }),
            Some(timeout + Duration::from_secs(2)),
        )
        .await
    }

    async fn wait_for_window_ready(
        &self,
        title_contains: &str,
        timeout: Duration,
    ) -> BackendResult<()> {
        self.call(
            "wait_for_window_ready",
            json!({
                "title_contains": title_contains,
                "timeout_secs": timeout.as_secs(),
            }),
            Some(timeout + Duration::from_secs(2)),
        )
        .await
    }

    async fn is_attached(&self) -> BackendResult<bool> {
        self.call("is_attached", json!({}), None).await
    }

    async fn is_enabled(&self, target: &ElementRef) -> BackendResult<bool> {
        self.call("is_enabled", json!({ "ref": target }), None).await
    }
}
