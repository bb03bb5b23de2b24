//! Request scoped state shared by the interceptors and the handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Request, Status};

use crate::auth::Claims;

pub const ENSIGN_SERVICE: &str = "ensign.v1beta1.Ensign";
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Message returned for every authorization failure after authentication.
pub const UNAUTHORIZED: &str = "not authorized to perform this action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Unary,
    ServerStream,
    BidiStream,
}

impl RpcKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcKind::Unary => "unary",
            RpcKind::ServerStream => "server_stream",
            RpcKind::BidiStream => "bidi_stream",
        }
    }
}

/// Static description of an RPC, used for routing decisions in the interceptors and
/// as metric labels.
#[derive(Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub service: &'static str,
    pub method: &'static str,
    pub kind: RpcKind,
    /// Public methods are not authenticated and answer in maintenance mode.
    pub public: bool,
}

impl MethodInfo {
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

pub mod methods {
    use super::{MethodInfo, RpcKind, ENSIGN_SERVICE, HEALTH_SERVICE};

    const fn ensign(method: &'static str, kind: RpcKind) -> MethodInfo {
        MethodInfo {
            service: ENSIGN_SERVICE,
            method,
            kind,
            public: false,
        }
    }

    pub static PUBLISH: MethodInfo = ensign("Publish", RpcKind::BidiStream);
    pub static SUBSCRIBE: MethodInfo = ensign("Subscribe", RpcKind::BidiStream);
    pub static ENSQL: MethodInfo = ensign("EnSQL", RpcKind::ServerStream);
    pub static EXPLAIN: MethodInfo = ensign("Explain", RpcKind::Unary);
    pub static LIST_TOPICS: MethodInfo = ensign("ListTopics", RpcKind::Unary);
    pub static CREATE_TOPIC: MethodInfo = ensign("CreateTopic", RpcKind::Unary);
    pub static RETRIEVE_TOPIC: MethodInfo = ensign("RetrieveTopic", RpcKind::Unary);
    pub static DELETE_TOPIC: MethodInfo = ensign("DeleteTopic", RpcKind::Unary);
    pub static TOPIC_NAMES: MethodInfo = ensign("TopicNames", RpcKind::Unary);
    pub static TOPIC_EXISTS: MethodInfo = ensign("TopicExists", RpcKind::Unary);
    pub static INFO: MethodInfo = ensign("Info", RpcKind::Unary);

    pub static STATUS: MethodInfo = MethodInfo {
        service: ENSIGN_SERVICE,
        method: "Status",
        kind: RpcKind::Unary,
        public: true,
    };

    pub static HEALTH_CHECK: MethodInfo = MethodInfo {
        service: HEALTH_SERVICE,
        method: "Check",
        kind: RpcKind::Unary,
        public: true,
    };

    pub static HEALTH_WATCH: MethodInfo = MethodInfo {
        service: HEALTH_SERVICE,
        method: "Watch",
        kind: RpcKind::ServerStream,
        public: true,
    };
}

#[derive(Debug, Clone)]
pub struct Context {
    pub method: &'static MethodInfo,
    metadata: Arc<MetadataMap>,
    remote_addr: Option<SocketAddr>,
    claims: Option<Arc<Claims>>,
    cancel: CancellationToken,
    monitored: bool,
}

impl Context {
    pub fn new(
        method: &'static MethodInfo,
        metadata: MetadataMap,
        remote_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            method,
            metadata: Arc::new(metadata),
            remote_addr,
            claims: None,
            cancel,
            monitored: false,
        }
    }

    pub fn from_request<T>(
        request: &Request<T>,
        method: &'static MethodInfo,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            method,
            request.metadata().clone(),
            request.remote_addr(),
            cancel,
        )
    }

    /// Attach verified claims; claims are never replaced once attached.
    pub fn with_claims(mut self, claims: Claims) -> Self {
        if self.claims.is_none() {
            self.claims = Some(Arc::new(claims));
        }
        self
    }

    pub fn claims(&self) -> Result<&Claims, Status> {
        self.claims
            .as_deref()
            .ok_or_else(|| Status::unauthenticated(UNAUTHORIZED))
    }

    /// The claims of the request if every permission is granted.
    pub fn authorize(&self, permissions: &[&str]) -> Result<&Claims, Status> {
        let claims = self.claims()?;
        if !claims.has_all_permissions(permissions) {
            tracing::debug!(
                method = self.method.method,
                required = ?permissions,
                "missing permissions"
            );
            return Err(Status::unauthenticated(UNAUTHORIZED));
        }
        Ok(claims)
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn user_agent(&self) -> String {
        self.metadata
            .get("user-agent")
            .and_then(|val| val.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn monitored(mut self) -> Self {
        self.monitored = true;
        self
    }

    pub(crate) fn is_monitored(&self) -> bool {
        self.monitored
    }
}
