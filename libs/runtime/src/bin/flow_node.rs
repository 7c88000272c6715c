//! Loopback demo - two nodes on an in-memory network
//!
//! Usage:
//!   flow-node --tokens 20
//!   flow-node --config config/node.toml --environment staging
//!
//! A counting source on `node-a` feeds a sink on `node-b` over the token
//! tunnel. Once every token has arrived the source node is quiesced and
//! both drivers shut down.

use anyhow::{Context, Result};
use clap::Parser;
use flow_config::RuntimeConfig;
use flow_network::InMemoryNetwork;
use flow_runtime::{
    init_tracing, Actor, ActorIo, InMemoryDirectory, Node, NodeDriver, PeerPort, PortDirectory,
};
use flow_types::{ActorId, NodeId, PortProperties, Token};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "flow-node")]
#[command(about = "Tokenflow two-node loopback demo")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment overlay to apply on top of the base file
    #[arg(short, long)]
    environment: Option<String>,

    /// Number of tokens to push through the tunnel
    #[arg(short, long, default_value_t = 20)]
    tokens: u64,

    /// Seconds to wait for delivery before giving up
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

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
        match io.write("out", Token::new(json!(self.next))) {
            Ok(()) => {
                self.next += 1;
                true
            }
            Err(_) => false,
        }
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
            Ok(token) => {
                let _ = self.delivered.send(token.value().clone());
                true
            }
            Err(_) => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RuntimeConfig::load(args.config.as_deref(), args.environment.as_deref())
        .context("loading runtime configuration")?;
    init_tracing(&config.node).context("initialising tracing")?;

    let network = InMemoryNetwork::new();
    let directory = InMemoryDirectory::new();
    let (a, b) = (NodeId::from("node-a"), NodeId::from("node-b"));

    let mut drivers = Vec::new();
    let mut handles = Vec::new();
    for id in [&a, &b] {
        let (link, inbox) = network.attach(id.clone(), config.tunnel.inbox_capacity);
        let directory: Arc<dyn PortDirectory> = Arc::new(directory.clone());
        let node = Node::new(id.clone(), config.clone(), directory);
        let (driver, handle) = NodeDriver::new(node, link, inbox);
        drivers.push(tokio::spawn(driver.run()));
        handles.push(handle);
    }
    let (node_a, node_b) = (&handles[0], &handles[1]);

    let source = ActorId::from("source");
    let sink = ActorId::from("sink");
    let out = node_a.add_port(&source, "out", PortProperties::outport()).await?;
    node_b.add_port(&sink, "in", PortProperties::inport()).await?;

    let (tx, mut delivered) = mpsc::unbounded_channel();
    node_b
        .add_actor(Box::new(Sink {
            id: sink.clone(),
            delivered: tx,
        }))
        .await?;
    node_a
        .add_actor(Box::new(Source {
            id: source,
            next: 0,
            limit: args.tokens,
        }))
        .await?;

    let response = node_a.connect(&out, PeerPort::by_name(sink, "in")).await?;
    anyhow::ensure!(response.is_success(), "connect failed: {}", response.status);
    info!(port_id = %out, "Source connected to sink over the token tunnel");

    let wait = tokio::time::timeout(Duration::from_secs(args.wait_secs), async {
        let mut received = 0;
        while received < args.tokens {
            match delivered.recv().await {
                Some(value) => {
                    info!(%value, "Token delivered");
                    received += 1;
                }
                None => break,
            }
        }
        received
    })
    .await;
    match wait {
        Ok(received) => info!(received, "Delivery complete"),
        Err(_) => warn!(expected = args.tokens, "Timed out waiting for delivery"),
    }

    let quiesced = node_a.quiesce(config.migration.timeout()).await?;
    info!(status = %quiesced.status, "Source node quiesced");
    for (name, handle) in [("node-a", node_a), ("node-b", node_b)] {
        info!(node = name, stats = ?handle.stats().await?, "Final counters");
        handle.shutdown().await?;
    }
    for driver in drivers {
        driver.await.context("node driver panicked")?;
    }
    Ok(())
}
