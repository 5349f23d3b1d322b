//! Node registry and remote node proxies.
//!
//! A [`RemoteNode`] is the handle through which this process talks to one
//! other process. Besides the generic `send`/`emit`/`call` it carries a
//! shortcut table copied from the local method registry when the node was
//! first seen: [`RemoteNode::invoke`] calls or emits depending on how the
//! method of the same name is declared locally.

use crate::correlator::RequestCorrelator;
use busrpc_types::{RpcError, RpcResult};
use busrpc_wire::{Broker, CallEnvelope, Envelope, MessageEnvelope};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Outbound half of a process: its identity, broker connection and
/// in-flight calls. Shared by every [`RemoteNode`] of that process.
pub(crate) struct Link {
    pub(crate) pid: String,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) correlator: RequestCorrelator,
    pub(crate) call_timeout: Duration,
}

impl Link {
    /// Publish `envelope` on its channel addressed to `target`.
    pub(crate) async fn publish(&self, target: &str, envelope: &Envelope) -> RpcResult<()> {
        let channel = envelope.event().targeted_channel(target);
        let payload = envelope.encode()?;
        self.broker.publish(&channel, payload).await?;
        Ok(())
    }

    /// Publish `envelope` on its bare channel.
    pub(crate) async fn broadcast(&self, envelope: &Envelope) -> RpcResult<()> {
        let channel = envelope.event().broadcast_channel();
        let payload = envelope.encode()?;
        self.broker.publish(&channel, payload).await?;
        Ok(())
    }

    /// Invoke `name` on `target`.
    ///
    /// Without `expects_response` the call is published and `Ok(None)`
    /// returned at once; whatever the remote handler does is unobservable.
    pub(crate) async fn remote_call(
        &self,
        target: &str,
        name: &str,
        args: Vec<Value>,
        expects_response: bool,
    ) -> RpcResult<Option<Value>> {
        let request_id = self.correlator.next_id();
        let envelope = Envelope::Call(CallEnvelope::new(&self.pid, &request_id, name, args));

        if !expects_response {
            self.publish(target, &envelope).await?;
            return Ok(None);
        }

        let pending = self.correlator.register(&request_id);
        self.publish(target, &envelope).await?;
        debug!(pid = %self.pid, to = target, method = name, request_id = %request_id, "call sent");

        let timeout_error = RpcError::Timeout {
            pid: self.pid.clone(),
            method: name.to_string(),
        };
        pending
            .wait(self.call_timeout, timeout_error)
            .await
            .map(Some)
    }
}

/// Proxy for one remote process.
///
/// Cheap to clone. A handle outlives the registry entry it came from: after
/// the remote disconnects, operations still go out over the broker but
/// nobody answers.
#[derive(Clone)]
pub struct RemoteNode {
    pid: Arc<str>,
    shortcuts: Arc<HashMap<String, bool>>,
    link: Arc<Link>,
}

impl RemoteNode {
    pub(crate) fn new(pid: &str, shortcuts: HashMap<String, bool>, link: Arc<Link>) -> Self {
        Self {
            pid: Arc::from(pid),
            shortcuts: Arc::new(shortcuts),
            link,
        }
    }

    /// The remote process id.
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Deliver a named message. No reply, no correlation.
    pub async fn send(&self, event: &str, data: Value) -> RpcResult<()> {
        let envelope = Envelope::Message(MessageEnvelope {
            pid: self.link.pid.clone(),
            event: event.to_string(),
            data,
        });
        self.link.publish(&self.pid, &envelope).await
    }

    /// Invoke a remote method without waiting for its result.
    pub async fn emit(&self, name: &str, args: Vec<Value>) -> RpcResult<()> {
        self.link
            .remote_call(&self.pid, name, args, false)
            .await
            .map(|_| ())
    }

    /// Invoke a remote method and wait for its result.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> RpcResult<Value> {
        let result = self.link.remote_call(&self.pid, name, args, true).await?;
        Ok(result.unwrap_or(Value::Null))
    }

    /// Invoke `name` through the shortcut table: `call` when the local
    /// method of that name responds (yielding `Some`), `emit` otherwise.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> RpcResult<Option<Value>> {
        match self.shortcuts.get(name) {
            Some(true) => self.call(name, args).await.map(Some),
            Some(false) => self.emit(name, args).await.map(|_| None),
            None => Err(RpcError::NoShortcut(name.to_string())),
        }
    }

    /// Whether `name` is in the shortcut table.
    pub fn has_shortcut(&self, name: &str) -> bool {
        self.shortcuts.contains_key(name)
    }

    /// Shortcut names, sorted.
    pub fn shortcuts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.shortcuts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("pid", &self.pid)
            .field("shortcuts", &self.shortcuts())
            .finish()
    }
}

/// The set of Known remote processes. Cloning shares the set.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, RemoteNode>>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the proxy for `pid`.
    pub fn get(&self, pid: &str) -> Option<RemoteNode> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(pid).cloned()
    }

    /// Whether `pid` is Known.
    pub fn contains(&self, pid: &str) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.contains_key(pid)
    }

    /// Known pids, sorted.
    pub fn pids(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut pids: Vec<String> = nodes.keys().cloned().collect();
        pids.sort_unstable();
        pids
    }

    /// Snapshot of every Known node.
    pub fn all(&self) -> Vec<RemoteNode> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.values().cloned().collect()
    }

    /// Number of Known nodes.
    pub fn len(&self) -> usize {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.len()
    }

    /// Whether no node is Known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `node`, replacing any entry with the same pid.
    pub(crate) fn insert(&self, node: RemoteNode) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.pid().to_string(), node);
    }

    /// Insert the node built by `make` unless `pid` is already Known.
    /// Returns the new node, or `None` if the pid was Known.
    pub(crate) fn insert_if_absent(
        &self,
        pid: &str,
        make: impl FnOnce() -> RemoteNode,
    ) -> Option<RemoteNode> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(pid) {
            return None;
        }
        let node = make();
        nodes.insert(pid.to_string(), node.clone());
        Some(node)
    }

    /// Remove `pid`, returning its proxy if it was Known.
    pub(crate) fn remove(&self, pid: &str) -> Option<RemoteNode> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.remove(pid)
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pids()).finish()
    }
}
