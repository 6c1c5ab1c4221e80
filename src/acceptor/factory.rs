use crate::acceptor::{AcceptEvent, Acceptor, SslStatsSink};
use crate::config::ServerConfig;
use crate::pipeline::{Pipeline, PipelineFactory};
use std::sync::Arc;

/// Builds the accept pipeline for one acceptor.
///
/// The returned pipeline is not finalized: the acceptor appends its default
/// terminal handler when a child factory is configured, then finalizes.
pub trait AcceptPipelineFactory: Send + Sync + 'static {
    fn new_pipeline(&self, acceptor: &Acceptor) -> Pipeline<AcceptEvent>;
}

/// Bare accept pipeline; the acceptor's own terminal does all the work.
#[derive(Debug, Default)]
pub struct DefaultAcceptPipelineFactory;

impl AcceptPipelineFactory for DefaultAcceptPipelineFactory {
    fn new_pipeline(&self, _acceptor: &Acceptor) -> Pipeline<AcceptEvent> {
        Pipeline::new()
    }
}

/// Constructs one acceptor per reactor thread; invoked on the owning
/// reactor by the worker pool's lifecycle callback.
pub trait AcceptorFactory: Send + Sync + 'static {
    fn new_acceptor(&self) -> anyhow::Result<Acceptor>;
}

/// The standard factory: carries the accept-pipeline and child-pipeline
/// factories plus the server configuration into each per-thread acceptor.
pub struct ServerAcceptorFactory {
    accept_pipeline_factory: Arc<dyn AcceptPipelineFactory>,
    child_pipeline_factory: Option<Arc<dyn PipelineFactory>>,
    config: Arc<ServerConfig>,
    ssl_stats: Option<Arc<dyn SslStatsSink>>,
}

impl ServerAcceptorFactory {
    pub fn new(
        accept_pipeline_factory: Arc<dyn AcceptPipelineFactory>,
        child_pipeline_factory: Option<Arc<dyn PipelineFactory>>,
        config: Arc<ServerConfig>,
        ssl_stats: Option<Arc<dyn SslStatsSink>>,
    ) -> Self {
        Self {
            accept_pipeline_factory,
            child_pipeline_factory,
            config,
            ssl_stats,
        }
    }
}

impl AcceptorFactory for ServerAcceptorFactory {
    fn new_acceptor(&self) -> anyhow::Result<Acceptor> {
        let acceptor = Acceptor::new(
            self.config.clone(),
            self.child_pipeline_factory.clone(),
            self.ssl_stats.clone(),
        );
        acceptor.init(self.accept_pipeline_factory.as_ref());
        Ok(acceptor)
    }
}
