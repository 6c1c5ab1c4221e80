pub use crate::acceptor::{
    AcceptEvent, AcceptPipelineFactory, Acceptor, AcceptorFactory, AcceptorStats,
    DefaultAcceptPipelineFactory, ServerAcceptorFactory, ServerConnection, SslStatsSink,
};
pub use crate::broadcast::{
    BroadcastHandler, BroadcastPipelineFactory, BroadcastPool, BroadcastStage, HandlerFuture,
    ObservingHandler, ObservingPipelineFactory, RoutingKey, ServerPool, StaticServerPool,
    Subscriber,
};
pub use crate::config::ServerConfig;
pub use crate::error::{AcceptorError, AcceptorResult};
pub use crate::pipeline::{
    ChunkDecoder, HandlerCtx, InboundHandler, LineDecoder, PassthroughEncoder, Pipeline,
    PipelineFactory, PipelineManager, PipelineWriter,
};
pub use crate::reactor::{
    EventLoop, IoExecutor, LifecycleObserver, ReactorContext, ReactorHandle, ReactorId,
};
pub use crate::server::{
    AcceptRoutingHandler, AcceptorHandle, RoutedPipelineFactory, RoutingAcceptPipelineFactory,
    RoutingDataParser, ServerBootstrap, ServerWorkerPool,
};
pub use crate::transport::{SecureTransportKind, Transport, TransportInfo};
pub use crate::utils::{CancelToken, HealthFlag, StateCell, logger::LoggerConfig};
