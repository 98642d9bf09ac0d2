//! Swarmcast Demo
//!
//! Starts a handful of relays on an in-process network, joins them to one
//! topic and lets them stream synthetic screens to each other:
//! - Lazy capture on the first connection
//! - Periodic keyframes
//! - Fan-out to every peer, decode of every peer
//! - Graceful leave with a disconnect handshake

use std::time::Duration;

use swarmcast_core::RelayConfig;
use swarmcast_runtime::logging::{self, LogFormat};
use swarmcast_runtime::RelayEvent;
use swarmcast_test::swarm;
use tracing::info;

struct DemoOptions {
    peers: usize,
    seconds: u64,
    topic: String,
    config: Option<String>,
    log_format: LogFormat,
}

impl DemoOptions {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = DemoOptions {
            peers: 3,
            seconds: 5,
            topic: "swarmcast-demo".to_string(),
            config: None,
            log_format: LogFormat::Pretty,
        };

        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--peers" => options.peers = next_value(&mut args, arg)?,
                "--seconds" => options.seconds = next_value(&mut args, arg)?,
                "--topic" => options.topic = next_value(&mut args, arg)?,
                "--config" => options.config = Some(next_value(&mut args, arg)?),
                "--log" => options.log_format = next_value(&mut args, arg)?,
                "--help" | "-h" => return Err(usage()),
                other => return Err(format!("unknown argument {}\n{}", other, usage())),
            }
        }

        if options.peers < 2 {
            return Err("a swarm needs at least 2 peers".to_string());
        }
        Ok(options)
    }
}

fn next_value<'a, T: std::str::FromStr>(
    args: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> Result<T, String> {
    args.next()
        .ok_or_else(|| format!("{} needs a value", flag))?
        .parse()
        .map_err(|_| format!("invalid value for {}", flag))
}

fn usage() -> String {
    "Usage: swarm-demo [--peers N] [--seconds S] [--topic NAME] [--config relay.json] [--log pretty|json]"
        .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match DemoOptions::parse(&args) {
        Ok(options) => options,
        Err(message) => {
            println!("{}", message);
            return Ok(());
        }
    };
    logging::init(options.log_format);

    let config = match &options.config {
        Some(path) => RelayConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => RelayConfig::default(),
    };

    println!("Swarmcast demo: {} peers on topic '{}'", options.peers, options.topic);

    let (_network, mut nodes) = swarm(options.peers, &config)?;

    // Narrate what the first node sees
    let mut events = nodes[0].relay.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RelayEvent::ConnectionCreated { id, info } => {
                    println!("  node 0: connection {} from {}..", id, info.short_key())
                }
                RelayEvent::ConnectionRemoved { id, reason } => {
                    println!("  node 0: connection {} closed ({})", id, reason)
                }
                RelayEvent::PeerCountChanged(n) => println!("  node 0: {} peer(s)", n),
                RelayEvent::PhaseChanged(phase) => println!("  node 0: {}", phase),
            }
        }
    });

    for (i, node) in nodes.iter().enumerate() {
        node.relay.join(&options.topic).await?;
        info!(node = i, "joined");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    tokio::time::sleep(Duration::from_secs(options.seconds)).await;

    println!();
    for (i, node) in nodes.iter_mut().enumerate() {
        let stats = node.relay.stats();
        let rendered = node.drain_rendered().len();
        println!(
            "node {}: peers={} captured={} keyframes={} sent={} received={} rendered={} failures={}",
            i,
            node.relay.peer_count(),
            stats.frames_captured,
            stats.forced_keyframes,
            stats.chunks_broadcast,
            stats.chunks_received,
            rendered,
            stats.write_failures,
        );
    }
    println!();

    for node in &nodes {
        node.relay.shutdown().await?;
    }
    watcher.abort();
    Ok(())
}
