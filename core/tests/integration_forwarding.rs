// Integration tests for the node facade
//
// Two nodes joined by the in-memory convergence layer exchange bundles
// through forward(): link-local route first, connection agent otherwise.

use async_trait::async_trait;
use dtnode_core::bundle::Bundle;
use dtnode_core::cla::{ClaChannel, MemoryCla};
use dtnode_core::config::{NodeConfig, COMPONENT_ENABLE_CONNECTION_AGENT, LOCAL_EID};
use dtnode_core::eid::Eid;
use dtnode_core::registrar::{SinkError, SinkHandler};
use dtnode_core::{Affinity, AgentError, EventKind, Forwarded, Node, NodeError, NodeEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Records payloads handed to it
#[derive(Default)]
struct Collector {
    payloads: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl SinkHandler for Collector {
    async fn deliver(&self, bundle: &mut Bundle) -> Result<(), SinkError> {
        self.payloads.lock().push(std::mem::take(&mut bundle.payload));
        Ok(())
    }
}

fn node(local_eid: &str) -> (Node, Arc<MemoryCla>) {
    let config = NodeConfig::default();
    config.set(LOCAL_EID, local_eid).unwrap();
    let node = Node::new(Arc::new(config));
    let cla = Arc::new(MemoryCla::new("mem"));
    node.add_cla(cla.clone()).unwrap();
    (node, cla)
}

fn bundle(destination: &str, payload: &[u8]) -> Bundle {
    Bundle::new(
        Eid::create("dtn://alpha/").unwrap(),
        Eid::create(destination).unwrap(),
        60_000,
        payload.to_vec(),
    )
}

#[tokio::test]
async fn test_local_destination_goes_to_sink() {
    let (node, _cla) = node("dtn://alpha/");
    node.start().unwrap();
    let collector = Arc::new(Collector::default());
    node.registrar().register("/inbox/", collector.clone()).unwrap();

    let outcome = node.forward(bundle("dtn://alpha/inbox/", b"hi")).await.unwrap();
    assert_eq!(outcome, Forwarded::Delivered);
    assert_eq!(collector.payloads.lock().clone(), vec![b"hi".to_vec()]);

    node.shutdown().await;
    println!("✓ Local bundle delivered to its sink");
}

#[tokio::test]
async fn test_expired_bundle_is_refused() {
    let (node, cla) = node("dtn://alpha/");
    let mut expired = bundle("cla:mem:beta:1/inbox/", b"late");
    expired.creation_timestamp_ms = 1;
    expired.lifetime_ms = 1;

    let err = node.forward(expired).await.err();
    assert!(matches!(err, Some(NodeError::BundleExpired(_))));
    assert_eq!(cla.open_attempts(), 0);
    println!("✓ Expired bundle refused before any transport work");
}

#[tokio::test]
async fn test_remote_destination_opens_then_reuses_route() {
    let (node, cla) = node("dtn://alpha/");
    node.start().unwrap();

    let first = node.forward(bundle("cla:mem:beta:1/inbox/", b"one")).await.unwrap();
    let next_hop = match first {
        Forwarded::Sent { next_hop } => next_hop,
        other => panic!("expected a send, got {:?}", other),
    };
    assert_eq!(next_hop.to_string(), "cla:mem:beta:1");
    assert_eq!(cla.open_attempts(), 1);
    assert_eq!(node.routing().len(), 1);

    node.forward(bundle("cla:mem:beta:1/inbox/", b"two")).await.unwrap();
    assert_eq!(cla.open_attempts(), 1, "second bundle used the link-local route");
    assert_eq!(node.manager().stats().open_requests, 1);

    let remote = cla.remote_end(&Eid::create("cla:mem:beta:1").unwrap()).unwrap();
    assert_eq!(remote.eid().to_string(), "cla:mem:localhost:0");

    node.shutdown().await;
    println!("✓ First bundle opened a channel, second followed the route");
}

#[tokio::test]
async fn test_no_route_and_agent_disabled() {
    let (node, cla) = node("dtn://alpha/");
    node.config().set(COMPONENT_ENABLE_CONNECTION_AGENT, "false").unwrap();
    node.start().unwrap();

    let err = node.forward(bundle("cla:mem:beta:1/inbox/", b"x")).await.err();
    assert_eq!(
        err,
        Some(NodeError::Agent(AgentError::ComponentDisabled(COMPONENT_ENABLE_CONNECTION_AGENT)))
    );
    assert_eq!(cla.open_attempts(), 0);

    node.shutdown().await;
    println!("✓ Disabled agent leaves unroutable bundles with the caller");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inbound_bundle_reaches_local_sink() {
    let (beta, beta_cla) = node("dtn://beta/");
    beta.start().unwrap();
    let collector = Arc::new(Collector::default());
    beta.registrar().register("/inbox/", collector.clone()).unwrap();

    let (opened_tx, mut opened_rx) = tokio::sync::mpsc::unbounded_channel();
    beta.bus()
        .subscribe("test-watch", EventKind::ChannelOpened, Affinity::Inline, move |event| {
            if let NodeEvent::ChannelOpened { eid, .. } = event {
                let _ = opened_tx.send(eid.clone());
            }
            Ok(())
        })
        .unwrap();
    beta.manager().start_cla("mem").await.unwrap();

    // alpha dials in over beta's transport
    let remote = beta_cla.accept(&Eid::create("cla:mem:alpha:1").unwrap()).unwrap();
    let opened = tokio::time::timeout(Duration::from_secs(2), opened_rx.recv())
        .await
        .expect("inbound channel not registered");
    assert_eq!(opened.map(|eid| eid.to_string()).as_deref(), Some("cla:mem:alpha:1"));

    remote.send(bundle("dtn://beta/inbox/", b"over the air")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while collector.payloads.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("inbound bundle never delivered");
    assert_eq!(collector.payloads.lock()[0], b"over the air");

    beta.shutdown().await;
    println!("✓ Inbound bundle forwarded to the local sink");
}
