//! Local application agent
//!
//! Request/response surface through which local applications register
//! sinks and pull delivered bundles. Encoding is left to the adapter that
//! carries these messages (socket, IPC, FFI); the types here are serde
//! ready for whichever codec it picks.

use crate::bundle::Bundle;
use crate::registrar::{canonical_path, Registrar, SinkError, SinkHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Bundles buffered per sink before deliveries are rejected
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

pub const FIELD_SINK: &str = "sink";
pub const FIELD_BID: &str = "bid";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_REASON: &str = "reason";
pub const FIELD_REGISTERED: &str = "registered";
pub const FIELD_PENDING: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestCode {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseCode {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    /// New data waits at the signalled sink
    DataAvailable,
}

/// Application to node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub code: RequestCode,
    pub path: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(path: &str) -> Self {
        Self::new(RequestCode::Get, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(RequestCode::Post, path)
    }

    fn new(code: RequestCode, path: &str) -> Self {
        Self {
            code,
            path: path.to_string(),
            fields: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Node to application, answering one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: ResponseCode,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            code: ResponseCode::Ok,
            fields: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            fields: BTreeMap::new(),
            body: Vec::new(),
        }
        .with_field(FIELD_REASON, &reason.into())
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Unsolicited notification to a connected application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub sink: String,
}

impl Signal {
    pub fn data_available(sink: &str) -> Self {
        Self {
            kind: SignalKind::DataAvailable,
            sink: sink.to_string(),
        }
    }
}

/// Sink that buffers bundles until the application fetches them
pub struct QueueSink {
    sink: String,
    queue: Mutex<VecDeque<Bundle>>,
    capacity: usize,
    signals: mpsc::UnboundedSender<Signal>,
}

impl QueueSink {
    pub fn new(sink: &str, capacity: usize, signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            sink: sink.to_string(),
            queue: Mutex::new(VecDeque::new()),
            capacity,
            signals,
        }
    }

    /// Oldest buffered bundle
    pub fn pop(&self) -> Option<Bundle> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[async_trait]
impl SinkHandler for QueueSink {
    async fn deliver(&self, bundle: &mut Bundle) -> Result<(), SinkError> {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(SinkError::Rejected(format!("queue full at {}", self.sink)));
            }
            let payload = std::mem::take(&mut bundle.payload);
            let mut queued = bundle.clone();
            queued.payload = payload;
            queue.push_back(queued);
        }

        if self.signals.send(Signal::data_available(&self.sink)).is_err() {
            debug!(sink = %self.sink, "No application listening for signals");
        }
        Ok(())
    }
}

/// Serves application requests against the registrar
pub struct AppAgent {
    registrar: Arc<Registrar>,
    queues: Mutex<HashMap<String, Arc<QueueSink>>>,
    signals: mpsc::UnboundedSender<Signal>,
    queue_capacity: usize,
}

impl AppAgent {
    /// Agent plus the receiving end of its signal channel
    pub fn new(registrar: Arc<Registrar>) -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let agent = Self {
            registrar,
            queues: Mutex::new(HashMap::new()),
            signals,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        };
        (agent, rx)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn handle(&self, request: &Request) -> Response {
        match (request.code, request.path.as_str()) {
            (RequestCode::Get, "/ping") => Response::ok().with_body(b"pong".to_vec()),
            (RequestCode::Post, "/register") => self.with_sink(request, |sink| self.register(sink)),
            (RequestCode::Post, "/unregister") => self.with_sink(request, |sink| self.unregister(sink)),
            (RequestCode::Get, "/isregistered") => self.with_sink(request, |sink| {
                Response::ok().with_field(FIELD_REGISTERED, &self.registrar.is_registered(sink).to_string())
            }),
            (RequestCode::Get, "/fetch") => self.with_sink(request, |sink| self.fetch(sink)),
            (code, path) => Response::error(format!("unknown endpoint: {:?} {}", code, path)),
        }
    }

    fn with_sink(&self, request: &Request, f: impl FnOnce(&str) -> Response) -> Response {
        match request.field(FIELD_SINK).and_then(canonical_path) {
            Some(sink) => f(&sink),
            None => Response::error(format!("missing field: {}", FIELD_SINK)),
        }
    }

    fn register(&self, sink: &str) -> Response {
        let queue = Arc::new(QueueSink::new(sink, self.queue_capacity, self.signals.clone()));
        match self.registrar.register(sink, queue.clone()) {
            Ok(()) => {
                self.queues.lock().insert(sink.to_string(), queue);
                info!(sink, "Application registered sink");
                Response::ok().with_field(FIELD_SINK, sink)
            }
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn unregister(&self, sink: &str) -> Response {
        if self.queues.lock().remove(sink).is_none() {
            return Response::error(format!("sink not registered by this agent: {}", sink));
        }
        self.registrar.unregister(sink);
        info!(sink, "Application unregistered sink");
        Response::ok()
    }

    fn fetch(&self, sink: &str) -> Response {
        let Some(queue) = self.queues.lock().get(sink).cloned() else {
            return Response::error(format!("sink not registered by this agent: {}", sink));
        };
        match queue.pop() {
            Some(bundle) => Response::ok()
                .with_field(FIELD_BID, &bundle.bid.to_string())
                .with_field(FIELD_SOURCE, &bundle.source.to_string())
                .with_field(FIELD_PENDING, &queue.len().to_string())
                .with_body(bundle.payload),
            None => Response::error(format!("no data at {}", sink)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::eid::local::LocalAddresses;
    use crate::eid::Eid;

    fn agent() -> (Arc<Registrar>, AppAgent, mpsc::UnboundedReceiver<Signal>) {
        let config = Arc::new(NodeConfig::default());
        let registrar = Arc::new(Registrar::new(config.clone(), LocalAddresses::new(config)));
        let (agent, signals) = AppAgent::new(registrar.clone());
        (registrar, agent, signals)
    }

    fn bundle_to(raw: &str, payload: &[u8]) -> Bundle {
        Bundle::new(
            Eid::create("dtn://remote/").unwrap(),
            Eid::create(raw).unwrap(),
            0,
            payload.to_vec(),
        )
    }

    #[test]
    fn test_ping() {
        let (_registrar, agent, _signals) = agent();
        let response = agent.handle(&Request::get("/ping"));
        assert!(response.is_ok());
        assert_eq!(response.body, b"pong");
    }

    #[test]
    fn test_unknown_endpoint_and_missing_field() {
        let (_registrar, agent, _signals) = agent();
        assert!(!agent.handle(&Request::get("/register")).is_ok());
        let response = agent.handle(&Request::post("/register"));
        assert_eq!(response.code, ResponseCode::Error);
        assert_eq!(response.field(FIELD_REASON), Some("missing field: sink"));
    }

    #[test]
    fn test_register_twice_fails() {
        let (registrar, agent, _signals) = agent();
        let request = Request::post("/register").with_field(FIELD_SINK, "/chat/");
        assert!(agent.handle(&request).is_ok());
        assert!(!agent.handle(&request).is_ok());
        assert!(registrar.is_registered("/chat/"));

        let response = agent.handle(&Request::get("/isregistered").with_field(FIELD_SINK, "chat"));
        assert_eq!(response.field(FIELD_REGISTERED), Some("true"));

        assert!(agent.handle(&Request::post("/unregister").with_field(FIELD_SINK, "/chat/")).is_ok());
        assert!(!registrar.is_registered("/chat/"));
    }

    #[tokio::test]
    async fn test_delivery_signals_and_fetches_in_order() {
        let (registrar, agent, mut signals) = agent();
        agent.handle(&Request::post("/register").with_field(FIELD_SINK, "/chat/"));

        let mut first = bundle_to("api:me/chat/", b"one");
        let first_bid = first.bid;
        registrar.deliver(&mut first).await.unwrap();
        assert!(first.payload.is_empty(), "queued bundle is consumed");
        registrar.deliver(&mut bundle_to("api:me/chat/", b"two")).await.unwrap();

        assert_eq!(signals.recv().await, Some(Signal::data_available("/chat/")));
        assert_eq!(signals.recv().await, Some(Signal::data_available("/chat/")));

        let fetch = Request::get("/fetch").with_field(FIELD_SINK, "/chat/");
        let response = agent.handle(&fetch);
        assert_eq!(response.body, b"one");
        assert_eq!(response.field(FIELD_BID), Some(first_bid.to_string().as_str()));
        assert_eq!(response.field(FIELD_PENDING), Some("1"));
        assert_eq!(agent.handle(&fetch).body, b"two");
        assert!(!agent.handle(&fetch).is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (registrar, agent, _signals) = agent();
        let agent = agent.with_queue_capacity(1);
        agent.handle(&Request::post("/register").with_field(FIELD_SINK, "/q/"));

        registrar.deliver(&mut bundle_to("api:me/q/", b"a")).await.unwrap();
        let mut second = bundle_to("api:me/q/", b"b");
        assert!(registrar.deliver(&mut second).await.is_err());
        assert_eq!(second.payload, b"b");
    }

    #[test]
    fn test_signal_serialization() {
        let json = serde_json::to_string(&Signal::data_available("/chat/")).unwrap();
        assert_eq!(json, r#"{"kind":"DATA_AVAILABLE","sink":"/chat/"}"#);
        let request: Request = serde_json::from_str(r#"{"code":"GET","path":"/ping"}"#).unwrap();
        assert_eq!(request, Request::get("/ping"));
    }
}
