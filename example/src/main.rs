//! Fan-out relay: clients send one line naming a feed, then receive that
//! feed's upstream bytes. All clients of one feed share a single upstream
//! connection per worker thread.
//!
//! ```text
//! UPSTREAM_ADDR=127.0.0.1:9000 LISTEN_ADDR=127.0.0.1:8000 relaycast-example
//! ```

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use relaycast::broadcast::{
    BroadcastHandler, BroadcastPipelineFactory, BroadcastStage, ObservingPipelineFactory,
    ServerPool, StaticServerPool,
};
use relaycast::config::ServerConfig;
use relaycast::pipeline::{ChunkDecoder, Pipeline};
use relaycast::server::{RoutingAcceptPipelineFactory, RoutingDataParser, ServerBootstrap};
use relaycast::transport::Transport;
use relaycast::utils::logger::LoggerConfig;
use std::sync::Arc;

/// First line of a connection names the feed it wants.
struct FeedLineParser;

impl RoutingDataParser for FeedLineParser {
    type Key = String;

    fn parse(&self, buf: &mut BytesMut) -> anyhow::Result<Option<String>> {
        let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = buf.split_to(pos + 1);
        let feed = std::str::from_utf8(&line[..pos])?.trim().to_string();
        if feed.is_empty() {
            anyhow::bail!("empty feed name");
        }
        Ok(Some(feed))
    }
}

/// Upstream pipelines are a plain broadcast stage over raw bytes.
struct FeedBroadcastFactory;

impl BroadcastPipelineFactory<Bytes, String> for FeedBroadcastFactory {
    fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<Bytes>> {
        let pipeline = Pipeline::new();
        pipeline.add(BroadcastStage::new(BroadcastHandler::new()));
        pipeline.finalize();
        pipeline.attach_transport(transport, ChunkDecoder);
        Ok(pipeline)
    }

    fn set_routing_data(&self, _pipeline: &Pipeline<Bytes>, key: &String) -> anyhow::Result<()> {
        tracing::info!("upstream connected for feed {key}");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let _log_guard = LoggerConfig::from_env().init()?;

    let listen = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
        .parse()
        .context("LISTEN_ADDR")?;
    let upstream = std::env::var("UPSTREAM_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9000".to_string())
        .parse()
        .context("UPSTREAM_ADDR")?;

    let server_pool = Arc::new(StaticServerPool::<String>::new());
    server_pool.set_default(upstream);

    let observing = ObservingPipelineFactory::bytes(
        server_pool as Arc<dyn ServerPool<String>>,
        Arc::new(FeedBroadcastFactory),
    );

    let server = ServerBootstrap::new(ServerConfig::default());
    let accept_factory = RoutingAcceptPipelineFactory::new(
        Arc::new(FeedLineParser),
        Arc::new(observing),
        server.pool(),
    );

    let mut server = server.accept_pipeline(accept_factory);
    let local = server.bind(listen)?;
    tracing::info!("relay listening on {local}, upstream {upstream}");
    server.start()?;
    server.run_until_terminated()
}
