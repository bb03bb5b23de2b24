//! # Server shell
//!
//! [`Node`] owns the stores, the dispatcher and the health state; [`Server`] binds the
//! gRPC listener, runs every RPC through the interceptor chain and shuts the node down
//! in order: refuse new work, cancel open streams, drain the dispatcher, flush the
//! store, stop the monitoring endpoints, then close the listener.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensign_api::health::v1::health_server::{Health, HealthServer};
use ensign_api::health::v1::{HealthCheckRequest, HealthCheckResponse};
use ensign_api::v1beta1::ensign_server::{Ensign, EnsignServer};
use ensign_api::v1beta1::{
    EventWrapper, HealthCheck, InfoRequest, PageInfo, ProjectInfo, PublisherReply, PublisherRequest,
    Query, QueryExplanation, ServiceState, SubscribeReply, SubscribeRequest, Topic, TopicExistsInfo,
    TopicMod, TopicName, TopicNamesPage, TopicTombstone, TopicsPage,
};
use ensign_store::{DataStore, MetaStore, Store, StoreError};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use ulid::Ulid;

use crate::auth::{AuthError, Authenticator, Validator};
use crate::config::{self, Config, ConfigError};
use crate::context::{methods, Context, MethodInfo};
use crate::duplicates::{self, RehashError, RehashStats};
use crate::health::{self, HealthState};
use crate::interceptors::{handler, Chain};
use crate::pubsub::PubSub;
use crate::streams::{Inbound, Outbound, ResponseStream, OUTBOUND_BUFFER};
use crate::{events, info, o11y, query, status, topics};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not create authenticator: {0}")]
    Auth(#[from] AuthError),
    #[error("could not open store: {0}")]
    Store(#[from] StoreError),
    #[error("could not bind listener: {0}")]
    Io(#[from] std::io::Error),
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// The state shared by every handler of a running node.
pub struct Node {
    conf: Config,
    server_id: String,
    store: Arc<Store>,
    pub(crate) meta: Arc<dyn MetaStore>,
    pub(crate) data: Arc<dyn DataStore>,
    pub(crate) pubsub: PubSub,
    pub(crate) health: HealthState,
    started: Instant,
}

impl Node {
    /// Must be called within a tokio runtime since the dispatcher starts immediately.
    pub fn new(conf: Config, store: Arc<Store>) -> Self {
        let server_id = match conf.monitoring.node_id.as_str() {
            "" => Ulid::new().to_string(),
            id => id.to_string(),
        };

        let data: Arc<dyn DataStore> = store.clone();
        Self {
            server_id,
            meta: store.clone(),
            pubsub: PubSub::new(data.clone()),
            data,
            store,
            health: HealthState::new(),
            started: Instant::now(),
            conf,
        }
    }

    /// Open the store described by the storage configuration.
    pub fn open_store(conf: &Config) -> Result<Store, StoreError> {
        if conf.storage.testing {
            return Ok(Store::in_memory(conf.storage.read_only));
        }
        Store::open(&conf.storage.data_path, conf.storage.read_only)
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn maintenance(&self) -> bool {
        self.conf.maintenance
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Rebuild the deduplication index of a topic under its current policy.
    pub async fn rehash(&self, topic_id: Ulid, cancel: &CancellationToken) -> Result<RehashStats, RehashError> {
        let topic = self.meta.retrieve_topic(topic_id).await?;
        let policy = topic.deduplication.unwrap_or_default();
        duplicates::rehash(self.data.as_ref(), topic_id, &policy, cancel).await
    }
}

/// Implements the gRPC services by running each call through the interceptor chain.
#[derive(Clone)]
struct Handler {
    node: Arc<Node>,
    chain: Chain,
    cancel: CancellationToken,
}

impl Handler {
    fn context<T>(&self, request: &Request<T>, method: &'static MethodInfo) -> Context {
        Context::from_request(request, method, self.cancel.child_token())
    }

    async fn unary<T, F, Fut>(&self, ctx: Context, f: F) -> Result<Response<T>, Status>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Node>, Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Status>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(shutting_down());
        }

        let node = self.node.clone();
        self.chain
            .run(ctx, handler(move |ctx| f(node, ctx)))
            .await
            .map(Response::new)
    }

    /// Run a streaming handler in its own task. The request is cancelled when the
    /// client drops the response stream, and an error from the chain is delivered as
    /// the final message of the stream.
    fn stream<T, F, Fut>(&self, ctx: Context, f: F) -> Response<ResponseStream<T>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Node>, Context, Outbound<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = ctx.cancel_token().clone();
        let node = self.node.clone();
        let chain = self.chain.clone();

        let closed = tx.clone();
        let watched = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.closed() => watched.cancel(),
                _ = watched.cancelled() => {}
            }
        });

        let failed = tx.clone();
        let stopping = self.cancel.is_cancelled();
        tokio::spawn(async move {
            let _guard = cancel.drop_guard();
            if stopping {
                let _ = failed.send(Err(shutting_down())).await;
                return;
            }

            let next = handler(move |ctx: Context| {
                let outbound = Outbound::new(tx, &ctx);
                f(node, ctx, outbound)
            });

            if let Err(status) = chain.run(ctx, next).await {
                // The client is already gone if this fails.
                let _ = failed.send(Err(status)).await;
            }
        });

        Response::new(ResponseStream::new(rx))
    }
}

fn shutting_down() -> Status {
    Status::unavailable("server is shutting down")
}

#[tonic::async_trait]
impl Ensign for Handler {
    type PublishStream = ResponseStream<PublisherReply>;
    type SubscribeStream = ResponseStream<SubscribeReply>;
    type EnSQLStream = ResponseStream<EventWrapper>;

    async fn publish(
        &self,
        request: Request<Streaming<PublisherRequest>>,
    ) -> Result<Response<Self::PublishStream>, Status> {
        let ctx = self.context(&request, &methods::PUBLISH);
        let stream = request.into_inner();
        Ok(self.stream(ctx, move |node, ctx, outbound| async move {
            let inbound = Inbound::new(stream, &ctx);
            events::publish(node, ctx, inbound, outbound).await
        }))
    }

    async fn subscribe(
        &self,
        request: Request<Streaming<SubscribeRequest>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let ctx = self.context(&request, &methods::SUBSCRIBE);
        let stream = request.into_inner();
        Ok(self.stream(ctx, move |node, ctx, outbound| async move {
            let inbound = Inbound::new(stream, &ctx);
            events::subscribe(node, ctx, inbound, outbound).await
        }))
    }

    async fn en_sql(&self, request: Request<Query>) -> Result<Response<Self::EnSQLStream>, Status> {
        let ctx = self.context(&request, &methods::ENSQL);
        let req = request.into_inner();
        Ok(self.stream(ctx, move |node, ctx, outbound| async move {
            query::ensql(&node, &ctx, req, outbound).await
        }))
    }

    async fn explain(&self, request: Request<Query>) -> Result<Response<QueryExplanation>, Status> {
        let ctx = self.context(&request, &methods::EXPLAIN);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { query::explain(&node, &ctx, req).await })
            .await
    }

    async fn list_topics(&self, request: Request<PageInfo>) -> Result<Response<TopicsPage>, Status> {
        let ctx = self.context(&request, &methods::LIST_TOPICS);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { topics::list_topics(&node, &ctx, req).await })
            .await
    }

    async fn create_topic(&self, request: Request<Topic>) -> Result<Response<Topic>, Status> {
        let ctx = self.context(&request, &methods::CREATE_TOPIC);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { topics::create_topic(&node, &ctx, req).await })
            .await
    }

    async fn retrieve_topic(&self, request: Request<Topic>) -> Result<Response<Topic>, Status> {
        let ctx = self.context(&request, &methods::RETRIEVE_TOPIC);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { topics::retrieve_topic(&node, &ctx, req).await })
            .await
    }

    async fn delete_topic(&self, request: Request<TopicMod>) -> Result<Response<TopicTombstone>, Status> {
        let ctx = self.context(&request, &methods::DELETE_TOPIC);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { topics::delete_topic(&node, &ctx, req).await })
            .await
    }

    async fn topic_names(&self, request: Request<PageInfo>) -> Result<Response<TopicNamesPage>, Status> {
        let ctx = self.context(&request, &methods::TOPIC_NAMES);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { topics::topic_names(&node, &ctx, req).await })
            .await
    }

    async fn topic_exists(&self, request: Request<TopicName>) -> Result<Response<TopicExistsInfo>, Status> {
        let ctx = self.context(&request, &methods::TOPIC_EXISTS);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { topics::topic_exists(&node, &ctx, req).await })
            .await
    }

    async fn info(&self, request: Request<InfoRequest>) -> Result<Response<ProjectInfo>, Status> {
        let ctx = self.context(&request, &methods::INFO);
        let req = request.into_inner();
        self.unary(ctx, move |node, ctx| async move { info::info(&node, &ctx, req).await })
            .await
    }

    async fn status(&self, request: Request<HealthCheck>) -> Result<Response<ServiceState>, Status> {
        let ctx = self.context(&request, &methods::STATUS);
        let req = request.into_inner();
        self.unary(ctx, move |node, _ctx| async move { Ok(status::status(&node, &req)) })
            .await
    }
}

#[tonic::async_trait]
impl Health for Handler {
    type WatchStream = ResponseStream<HealthCheckResponse>;

    async fn check(&self, request: Request<HealthCheckRequest>) -> Result<Response<HealthCheckResponse>, Status> {
        let ctx = self.context(&request, &methods::HEALTH_CHECK);
        let req = request.into_inner();
        self.unary(ctx, move |node, _ctx| async move { health::check(&node.health, req) })
            .await
    }

    async fn watch(&self, request: Request<HealthCheckRequest>) -> Result<Response<Self::WatchStream>, Status> {
        let ctx = self.context(&request, &methods::HEALTH_WATCH);
        let req = request.into_inner();
        Ok(self.stream(ctx, move |node, ctx, outbound| async move {
            health::watch(&node.health, &ctx, req, outbound).await
        }))
    }
}

pub struct Server {
    node: Arc<Node>,
    chain: Chain,
    // Cancels in-flight requests and open streams; new requests are refused.
    cancel: CancellationToken,
    monitor: CancellationToken,
    listener: CancellationToken,
    monitoring: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Validate the configuration, open the store and create the JWKS validator.
    /// Must be called within a tokio runtime.
    pub fn new(conf: Config) -> Result<Self, ServerError> {
        conf.mark()?;
        let store = Arc::new(Node::open_store(&conf)?);
        let validator = Arc::new(Validator::new(&conf.auth)?);
        Ok(Self::with_authenticator(conf, store, validator))
    }

    pub fn with_authenticator(conf: Config, store: Arc<Store>, authenticator: Arc<dyn Authenticator>) -> Self {
        let chain = Chain::for_node(conf.maintenance, authenticator);
        Self {
            node: Arc::new(Node::new(conf, store)),
            chain,
            cancel: CancellationToken::new(),
            monitor: CancellationToken::new(),
            listener: CancellationToken::new(),
            monitoring: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Bind the configured address and serve until [`Server::shutdown`] is called.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let addr = self.node.conf.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener).await
    }

    pub async fn serve_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let conf = &self.node.conf;
        if conf.monitoring.enabled {
            let addr = config::resolve_addr(&conf.monitoring.bind_addr)?;
            let monitor = TcpListener::bind(addr).await?;
            let ready = self.node.health.subscribe();
            let cancel = self.monitor.clone();
            let task = tokio::spawn(async move {
                if let Err(err) = o11y::serve(monitor, ready, cancel).await {
                    tracing::error!(report = true, error = %err, "monitoring server failed");
                }
            });
            *self.monitoring.lock().await = Some(task);
        }

        let handler = Handler {
            node: self.node.clone(),
            chain: self.chain.clone(),
            cancel: self.cancel.clone(),
        };

        tracing::info!(
            addr = %listener.local_addr()?,
            server_id = self.node.server_id(),
            maintenance = conf.maintenance,
            version = crate::VERSION,
            "ensign server started"
        );
        self.node.health.serving();

        let result = tonic::transport::Server::builder()
            .add_service(EnsignServer::new(handler.clone()))
            .add_service(HealthServer::new(handler))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), self.listener.clone().cancelled_owned())
            .await;

        self.node.health.not_serving();
        result?;
        tracing::info!("ensign server stopped");
        Ok(())
    }

    /// Stop the node. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        tracing::info!("gracefully shutting down ensign server");
        self.node.health.not_serving();
        self.cancel.cancel();

        self.node.pubsub.shutdown().await;
        let synced = self.node.store.sync().await;

        self.monitor.cancel();
        if let Some(task) = self.monitoring.lock().await.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "monitoring server task failed");
            }
        }

        self.listener.cancel();
        synced.map_err(ServerError::from)
    }
}
