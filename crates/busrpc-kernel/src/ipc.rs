//! Ipc: one participating process.
//!
//! [`Ipc::connect`] subscribes to the process's channel set, starts the
//! dispatch loop and broadcasts a presence announcement. Discovery then
//! runs by itself:
//!
//! - `rp:connect` from X: X becomes Known (a fresh node replaces any old
//!   one), an `rp:info` carrying our pid goes back to X, `connect` is raised
//! - `rp:info` from X: X becomes Known and `connect` is raised, unless X was
//!   already Known
//! - `rp:disconnect` from X: X is removed and `disconnect` is raised, if it
//!   was Known
//!
//! Announcements carrying our own pid (the broker echoes broadcasts back
//! to their publisher) are ignored.

use crate::correlator::RequestCorrelator;
use crate::events::{Disposer, EventHub, CONNECT_EVENT, DISCONNECT_EVENT};
use crate::methods::{Method, MethodRegistry};
use crate::node::{Link, NodeRegistry, RemoteNode};

use busrpc_types::{IpcConfig, RpcError, RpcResult};
use busrpc_wire::{
    subscription_channels, Broker, BrokerMessage, CallEnvelope, Envelope, Event,
    MessageEnvelope, ResponseEnvelope,
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A process on the bus. Cloning yields another handle to the same process.
#[derive(Clone)]
pub struct Ipc {
    core: Arc<Core>,
}

struct Core {
    link: Arc<Link>,
    methods: MethodRegistry,
    nodes: NodeRegistry,
    events: EventHub,
    connected: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Ipc {
    /// Create a process that talks through `broker`. Nothing is subscribed
    /// or published until [`connect`](Self::connect).
    pub fn new(broker: Arc<dyn Broker>, config: IpcConfig) -> Self {
        let link = Arc::new(Link {
            call_timeout: config.call_timeout(),
            pid: config.pid,
            broker,
            correlator: RequestCorrelator::new(),
        });
        Self {
            core: Arc::new(Core {
                link,
                methods: MethodRegistry::new(),
                nodes: NodeRegistry::new(),
                events: EventHub::new(),
                connected: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// This process's id.
    pub fn pid(&self) -> &str {
        &self.core.link.pid
    }

    /// How long a call waits for its response.
    pub fn call_timeout(&self) -> Duration {
        self.core.link.call_timeout
    }

    /// Whether [`connect`](Self::connect) succeeded and [`close`](Self::close)
    /// has not been called since.
    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire)
    }

    /// The Known remote processes.
    pub fn nodes(&self) -> &NodeRegistry {
        &self.core.nodes
    }

    /// The proxy for `pid`, if Known.
    pub fn node(&self, pid: &str) -> Option<RemoteNode> {
        self.core.nodes.get(pid)
    }

    /// Number of calls of this process awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.core.link.correlator.pending_count()
    }

    /// Expose a method whose result is sent back to the caller.
    pub fn declare<F, Fut>(&self, name: &str, handler: F) -> RpcResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.core.methods.declare(name, handler, true)
    }

    /// Expose a method that never answers, even when called.
    pub fn declare_oneway<F, Fut>(&self, name: &str, handler: F) -> RpcResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.core.methods.declare(name, handler, false)
    }

    /// Listen for messages named `event`, or for the lifecycle events
    /// [`CONNECT_EVENT`] / [`DISCONNECT_EVENT`].
    pub fn on<F>(&self, event: &str, listener: F) -> Disposer
    where
        F: Fn(&RemoteNode, &Value) + Send + Sync + 'static,
    {
        self.core.events.on(event, listener)
    }

    /// Listen for remote processes becoming Known.
    pub fn on_connect<F>(&self, listener: F) -> Disposer
    where
        F: Fn(&RemoteNode) + Send + Sync + 'static,
    {
        self.on(CONNECT_EVENT, move |node, _| listener(node))
    }

    /// Listen for remote processes leaving.
    pub fn on_disconnect<F>(&self, listener: F) -> Disposer
    where
        F: Fn(&RemoteNode) + Send + Sync + 'static,
    {
        self.on(DISCONNECT_EVENT, move |node, _| listener(node))
    }

    /// Join the bus: subscribe, start dispatching, announce ourselves.
    pub async fn connect(&self) -> RpcResult<()> {
        if self.core.connected.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyConnected);
        }

        let channels = subscription_channels(self.pid());
        let (sink, inbound) = mpsc::unbounded_channel();
        if let Err(e) = self.core.link.broker.subscribe(&channels, sink).await {
            self.core.connected.store(false, Ordering::Release);
            return Err(e.into());
        }

        let handle = tokio::spawn(dispatch_loop(Arc::downgrade(&self.core), inbound));
        *self
            .core
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        self.core
            .link
            .broadcast(&Envelope::Connect(self.pid().to_string()))
            .await?;
        info!(pid = %self.pid(), "connected");
        Ok(())
    }

    /// Leave the bus: announce departure, drop local listeners, unsubscribe
    /// and close the broker connection.
    ///
    /// Calls still awaiting a response are left to time out. Known nodes
    /// stay listed, but addressing them fails with
    /// [`RpcError::NotConnected`].
    pub async fn close(&self) -> RpcResult<()> {
        let was_connected = self.core.connected.swap(false, Ordering::AcqRel);

        let announced = if was_connected {
            self.core
                .link
                .broadcast(&Envelope::Disconnect(self.pid().to_string()))
                .await
        } else {
            Ok(())
        };

        self.core.events.clear();

        if was_connected {
            let channels = subscription_channels(self.pid());
            if let Err(e) = self.core.link.broker.unsubscribe(&channels).await {
                debug!(pid = %self.pid(), "unsubscribe on close failed: {}", e);
            }
        }
        self.core.stop_dispatcher();
        self.core.link.broker.close().await?;

        info!(pid = %self.pid(), "closed");
        announced
    }

    /// Call `name` on process `pid` and wait for the result.
    pub async fn call(&self, pid: &str, name: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.addressed(pid, "call", name)?.call(name, args).await
    }

    /// Invoke `name` on process `pid` without waiting.
    pub async fn emit(&self, pid: &str, name: &str, args: Vec<Value>) -> RpcResult<()> {
        self.addressed(pid, "emit", name)?.emit(name, args).await
    }

    /// Send message `event` to process `pid`.
    pub async fn send(&self, pid: &str, event: &str, data: Value) -> RpcResult<()> {
        self.addressed(pid, "send", event)?.send(event, data).await
    }

    /// Send message `event` to every Known process.
    ///
    /// Every node is attempted; the first failure is returned.
    pub async fn send_all(&self, event: &str, data: Value) -> RpcResult<()> {
        self.ensure_connected()?;
        let mut first_error = None;
        for node in self.core.nodes.all() {
            if let Err(e) = node.send(event, data.clone()).await {
                warn!(pid = %self.pid(), to = node.pid(), "send_all: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Emit `name` with the single argument `data` on every Known process.
    ///
    /// Every node is attempted; the first failure is returned.
    pub async fn emit_all(&self, name: &str, data: Value) -> RpcResult<()> {
        self.ensure_connected()?;
        let mut first_error = None;
        for node in self.core.nodes.all() {
            if let Err(e) = node.emit(name, vec![data.clone()]).await {
                warn!(pid = %self.pid(), to = node.pid(), "emit_all: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The Known node `pid`, checked before anything is published.
    fn addressed(&self, pid: &str, verb: &'static str, target: &str) -> RpcResult<RemoteNode> {
        let node = self.core.nodes.get(pid).ok_or_else(|| RpcError::NodeNotFound {
            verb,
            target: target.to_string(),
            pid: pid.to_string(),
        })?;
        self.ensure_connected()?;
        Ok(node)
    }

    fn ensure_connected(&self) -> RpcResult<()> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Ipc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipc")
            .field("pid", &self.pid())
            .field("connected", &self.is_connected())
            .field("nodes", &self.core.nodes)
            .finish()
    }
}

/// Drain the inbound queue until the process is dropped or closed.
async fn dispatch_loop(core: Weak<Core>, mut inbound: mpsc::UnboundedReceiver<BrokerMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(core) = core.upgrade() else {
            return;
        };
        core.dispatch(message).await;
    }
}

impl Core {
    fn pid(&self) -> &str {
        &self.link.pid
    }

    fn stop_dispatcher(&self) {
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Build a proxy for `pid` from the current method table.
    fn make_node(&self, pid: &str) -> RemoteNode {
        RemoteNode::new(pid, self.methods.snapshot(), Arc::clone(&self.link))
    }

    async fn dispatch(&self, message: BrokerMessage) {
        let Some(event) = Event::from_channel(&message.channel, self.pid()) else {
            debug!(pid = %self.pid(), channel = %message.channel, "message on foreign channel");
            return;
        };
        let envelope = match Envelope::decode(event, &message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(pid = %self.pid(), channel = %message.channel, "dropping undecodable payload: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Connect(pid) => self.on_remote_connect(&pid).await,
            Envelope::Info(pid) => self.on_remote_info(&pid),
            Envelope::Disconnect(pid) => self.on_remote_disconnect(&pid),
            Envelope::Message(message) => self.on_message(message),
            Envelope::Call(call) => self.on_call(call),
            Envelope::Response(response) => {
                self.link.correlator.resolve(response);
            }
        }
    }

    async fn on_remote_connect(&self, pid: &str) {
        if pid == self.pid() {
            return;
        }
        let node = self.make_node(pid);
        self.nodes.insert(node.clone());
        info!(pid = %self.pid(), remote = pid, "node connected");

        let reply = Envelope::Info(self.pid().to_string());
        if let Err(e) = self.link.publish(pid, &reply).await {
            warn!(pid = %self.pid(), remote = pid, "info reply failed: {}", e);
        }
        self.events.emit(CONNECT_EVENT, &node, &Value::Null);
    }

    fn on_remote_info(&self, pid: &str) {
        if pid == self.pid() {
            return;
        }
        if let Some(node) = self.nodes.insert_if_absent(pid, || self.make_node(pid)) {
            info!(pid = %self.pid(), remote = pid, "node discovered");
            self.events.emit(CONNECT_EVENT, &node, &Value::Null);
        }
    }

    fn on_remote_disconnect(&self, pid: &str) {
        if pid == self.pid() {
            return;
        }
        if let Some(node) = self.nodes.remove(pid) {
            info!(pid = %self.pid(), remote = pid, "node disconnected");
            self.events.emit(DISCONNECT_EVENT, &node, &Value::Null);
        }
    }

    fn on_message(&self, message: MessageEnvelope) {
        let Some(node) = self.nodes.get(&message.pid) else {
            debug!(pid = %self.pid(), from = %message.pid, "message from unknown node");
            return;
        };
        self.events.emit(&message.event, &node, &message.data);
    }

    fn on_call(&self, call: CallEnvelope) {
        let Some(method) = self.methods.get(&call.name) else {
            debug!(pid = %self.pid(), method = %call.name, "call to undeclared method dropped");
            return;
        };
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            run_call(link, method, call).await;
        });
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop_dispatcher();
    }
}

/// Execute one inbound call and answer it when the method responds.
async fn run_call(link: Arc<Link>, method: Method, mut call: CallEnvelope) {
    let args = std::mem::take(&mut call.args);
    let result = method.invoke(&call.name, args).await;

    let (caller, request_id) = match call.caller() {
        (caller, Some(request_id)) if method.responds => (caller, request_id),
        _ => {
            if let Err(e) = result {
                debug!(pid = %link.pid, method = %call.name, "oneway call failed: {}", e);
            }
            return;
        }
    };

    let response = match result {
        Ok(data) => ResponseEnvelope::ok(request_id, data),
        Err(error) => ResponseEnvelope::err(request_id, error),
    };
    if let Err(e) = link.publish(caller, &Envelope::Response(response)).await {
        warn!(pid = %link.pid, to = caller, method = %call.name, "response publish failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busrpc_wire::LocalBroker;
    use serde_json::json;

    fn ipc(broker: &LocalBroker, pid: &str) -> Ipc {
        Ipc::new(Arc::new(broker.connection()), IpcConfig::with_pid(pid))
    }

    #[tokio::test]
    async fn test_connect_subscribes_own_channels() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        p1.connect().await.unwrap();

        assert!(p1.is_connected());
        assert_eq!(broker.subscriber_count("rp:connect"), 1);
        assert_eq!(broker.subscriber_count("rp:call:p1"), 1);
        assert_eq!(broker.subscriber_count("rp:call:p2"), 0);

        assert_eq!(p1.connect().await, Err(RpcError::AlreadyConnected));
        p1.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_announcement_is_ignored() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        p1.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(p1.nodes().is_empty());
        p1.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_subscriptions_and_listeners() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        p1.on("anything", |_, _| {});
        p1.connect().await.unwrap();
        p1.close().await.unwrap();

        assert!(!p1.is_connected());
        assert_eq!(broker.subscriber_count("rp:connect"), 0);
        assert_eq!(p1.core.events.listener_count("anything"), 0);
    }

    #[tokio::test]
    async fn test_addressing_error_before_any_publish() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");

        let err = p1.call("p3", "test", vec![json!("test")]).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot call test - process with id p3 not found");
        assert!(matches!(
            p1.emit("p3", "test", vec![]).await,
            Err(RpcError::NodeNotFound { verb: "emit", .. })
        ));
        assert!(matches!(
            p1.send("p3", "test", json!("test")).await,
            Err(RpcError::NodeNotFound { verb: "send", .. })
        ));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        let p2 = ipc(&broker, "p2");
        p1.connect().await.unwrap();
        p2.connect().await.unwrap();
        while !p1.nodes().contains("p2") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        p1.close().await.unwrap();
        assert_eq!(
            p1.send("p2", "test", json!(1)).await,
            Err(RpcError::NotConnected)
        );
        assert_eq!(p1.send_all("test", json!(1)).await, Err(RpcError::NotConnected));
        p2.close().await.unwrap();
    }

    #[test]
    fn test_declare_reserved_name() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        let err = p1
            .declare("send", |_args| async { Ok(Value::Null) })
            .unwrap_err();
        assert_eq!(err, RpcError::ReservedMethod("send".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_info_and_unknown_disconnect_are_ignored() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        let p2 = ipc(&broker, "p2");

        let connects = Arc::new(Mutex::new(0));
        let disconnects = Arc::new(Mutex::new(0));
        let c = Arc::clone(&connects);
        p1.on_connect(move |_| *c.lock().unwrap() += 1);
        let d = Arc::clone(&disconnects);
        p1.on_disconnect(move |_| *d.lock().unwrap() += 1);

        p1.connect().await.unwrap();
        p2.connect().await.unwrap();
        while !p1.nodes().contains("p2") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*connects.lock().unwrap(), 1);

        let other = broker.connection();
        other.publish("rp:info:p1", b"\"p2\"".to_vec()).await.unwrap();
        other.publish("rp:info", b"\"p2\"".to_vec()).await.unwrap();
        other.publish("rp:disconnect", b"\"zz\"".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*connects.lock().unwrap(), 1);
        assert_eq!(*disconnects.lock().unwrap(), 0);
        assert_eq!(p1.nodes().pids(), vec!["p2"]);

        p1.close().await.unwrap();
        p2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let broker = LocalBroker::new();
        let p1 = ipc(&broker, "p1");
        p1.connect().await.unwrap();

        let other = broker.connection();
        other.publish("rp:connect", b"not json".to_vec()).await.unwrap();
        other.publish("rp:connect", b"\"p2\"".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The loop survived the bad payload and handled the next one
        assert!(p1.nodes().contains("p2"));
        p1.close().await.unwrap();
    }
}
