use crate::pipeline::Pipeline;
use crate::transport::Transport;
use bytes::Bytes;

/// Builds a child pipeline over a freshly accepted transport.
///
/// The factory adds its handlers, finalizes the chain, and attaches the
/// transport. The caller (the acceptor's terminal handler) then fires
/// `transport_active` and registers the connection for tracking.
pub trait PipelineFactory: Send + Sync + 'static {
    fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<Bytes>>;
}
