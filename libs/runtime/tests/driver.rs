//! Node drivers on an in-memory network

use flow_config::RuntimeConfig;
use flow_network::InMemoryNetwork;
use flow_runtime::{
    Actor, ActorIo, InMemoryDirectory, Node, NodeDriver, NodeHandle, PeerPort, PortDirectory, RuntimeError,
};
use flow_types::{ActorId, NodeId, PortId, PortProperties, Status, Token};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Source {
    id: ActorId,
    next: u64,
    limit: u64,
}

impl Actor for Source {
    fn id(&self) -> &ActorId {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.next < self.limit
    }

    fn fire(&mut self, io: &mut ActorIo<'_>) -> bool {
        if !io.slots_available("out", 1) {
            return false;
        }
        let written = io.write("out", Token::new(json!(self.next))).is_ok();
        if written {
            self.next += 1;
        }
        written
    }
}

struct Sink {
    id: ActorId,
    delivered: mpsc::UnboundedSender<Value>,
}

impl Actor for Sink {
    fn id(&self) -> &ActorId {
        &self.id
    }

    fn fire(&mut self, io: &mut ActorIo<'_>) -> bool {
        match io.read("in") {
            Ok(token) => self.delivered.send(token.value().clone()).is_ok(),
            Err(_) => false,
        }
    }
}

fn spawn(network: &InMemoryNetwork, directory: &InMemoryDirectory, id: &str) -> (NodeHandle, JoinHandle<Node>) {
    let config = RuntimeConfig::default();
    let id = NodeId::from(id);
    let (link, inbox) = network.attach(id.clone(), config.tunnel.inbox_capacity);
    let directory: Arc<dyn PortDirectory> = Arc::new(directory.clone());
    let (driver, handle) = NodeDriver::new(Node::new(id, config, directory), link, inbox);
    (handle, tokio::spawn(driver.run()))
}

async fn collect(delivered: &mut mpsc::UnboundedReceiver<Value>, n: usize) -> Vec<Value> {
    let mut values = Vec::with_capacity(n);
    while values.len() < n {
        match delivered.recv().await {
            Some(value) => values.push(value),
            None => break,
        }
    }
    values
}

#[test_log::test(tokio::test)]
async fn drivers_move_tokens_between_nodes() {
    let network = InMemoryNetwork::new();
    let directory = InMemoryDirectory::new();
    let (a, task_a) = spawn(&network, &directory, "a");
    let (b, task_b) = spawn(&network, &directory, "b");

    let source = ActorId::from("source");
    let sink = ActorId::from("sink");
    let out = a.add_port(&source, "out", PortProperties::outport()).await.unwrap();
    b.add_port(&sink, "in", PortProperties::inport()).await.unwrap();

    let (tx, mut delivered) = mpsc::unbounded_channel();
    b.add_actor(Box::new(Sink { id: sink.clone(), delivered: tx })).await.unwrap();
    a.add_actor(Box::new(Source {
        id: source,
        next: 0,
        limit: 8,
    }))
    .await
    .unwrap();

    let response = a.connect(&out, PeerPort::by_name(sink, "in")).await.unwrap();
    assert_eq!(response.status, Status::Ok);

    let values = tokio::time::timeout(Duration::from_secs(5), collect(&mut delivered, 8))
        .await
        .unwrap();
    assert_eq!(values, (0..8).map(|i| json!(i)).collect::<Vec<_>>());

    let quiesced = a.quiesce(Duration::from_secs(5)).await.unwrap();
    assert_eq!(quiesced.status, Status::Ok);

    let stats = a.stats().await.unwrap();
    assert!(stats.endpoint.tokens_sent >= 8);
    assert_eq!(b.stats().await.unwrap().endpoint.tokens_received, 8);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    let node = task_a.await.unwrap();
    assert_eq!(node.id(), &NodeId::from("a"));
    task_b.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn connect_to_unknown_runtime_fails() {
    let network = InMemoryNetwork::new();
    let directory = InMemoryDirectory::new();
    let (a, task) = spawn(&network, &directory, "a");

    let out = a
        .add_port(&ActorId::from("source"), "out", PortProperties::outport())
        .await
        .unwrap();
    let peer = PeerPort::by_id(PortId::from("elsewhere")).on(NodeId::from("ghost"));
    let response = tokio::time::timeout(Duration::from_secs(5), a.connect(&out, peer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, Status::InternalError);

    a.shutdown().await.unwrap();
    task.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn handle_reports_stopped_driver() {
    let network = InMemoryNetwork::new();
    let directory = InMemoryDirectory::new();
    let (a, task) = spawn(&network, &directory, "a");

    a.shutdown().await.unwrap();
    task.await.unwrap();

    let err = a.stats().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Stopped { .. }));
}
