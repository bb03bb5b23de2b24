//! # Interceptors
//!
//! Every RPC handler runs inside an ordered chain of interceptors, outermost first:
//! monitoring, panic recovery, then either the maintenance gate or authentication.
//! Streaming handlers run their whole stream inside the chain so that an interceptor
//! error becomes the first message the client receives.

pub mod auth;
pub mod maintenance;
pub mod monitoring;
pub mod recovery;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tonic::Status;

use crate::auth::Authenticator;
use crate::context::Context;

pub type HandlerFuture<T> = BoxFuture<'static, Result<T, Status>>;

/// The remainder of the chain, ending in the handler.
pub type Next<T> = Box<dyn FnOnce(Context) -> HandlerFuture<T> + Send>;

/// Box a handler closure so that it can terminate a chain.
pub fn handler<T, F, Fut>(f: F) -> Next<T>
where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Status>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

#[derive(Clone)]
pub enum Interceptor {
    Monitoring,
    Recovery,
    Maintenance,
    Auth(Arc<dyn Authenticator>),
}

impl Interceptor {
    pub fn name(&self) -> &'static str {
        match self {
            Interceptor::Monitoring => "monitoring",
            Interceptor::Recovery => "recovery",
            Interceptor::Maintenance => "maintenance",
            Interceptor::Auth(_) => "auth",
        }
    }

    fn wrap<T: Send + 'static>(&self, next: Next<T>) -> Next<T> {
        let this = self.clone();
        Box::new(move |ctx| Box::pin(this.intercept(ctx, next)))
    }

    async fn intercept<T: Send + 'static>(self, ctx: Context, next: Next<T>) -> Result<T, Status> {
        match self {
            Interceptor::Monitoring => monitoring::intercept(ctx, next).await,
            Interceptor::Recovery => recovery::intercept(ctx, next).await,
            Interceptor::Maintenance => maintenance::intercept(ctx, next).await,
            Interceptor::Auth(authenticator) => auth::intercept(authenticator, ctx, next).await,
        }
    }
}

#[derive(Clone)]
pub struct Chain {
    interceptors: Arc<[Interceptor]>,
}

impl Chain {
    pub fn new(interceptors: Vec<Interceptor>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// The chain of a running node. In maintenance mode the maintenance gate replaces
    /// authentication since only public methods are served.
    pub fn for_node(maintenance: bool, authenticator: Arc<dyn Authenticator>) -> Self {
        if maintenance {
            Self::new(vec![
                Interceptor::Monitoring,
                Interceptor::Recovery,
                Interceptor::Maintenance,
            ])
        } else {
            Self::new(vec![
                Interceptor::Monitoring,
                Interceptor::Recovery,
                Interceptor::Auth(authenticator),
            ])
        }
    }

    pub fn interceptors(&self) -> &[Interceptor] {
        &self.interceptors
    }

    pub async fn run<T: Send + 'static>(&self, ctx: Context, handler: Next<T>) -> Result<T, Status> {
        let next = self
            .interceptors
            .iter()
            .rev()
            .fold(handler, |next, interceptor| interceptor.wrap(next));
        next(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Claims};
    use crate::context::{methods, tests::context, MethodInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use tonic::metadata::MetadataMap;
    use tonic::Code;

    struct StaticTokens;

    #[async_trait]
    impl Authenticator for StaticTokens {
        async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
            match token {
                "good" => Ok(Claims {
                    sub: "tester".into(),
                    permissions: vec!["publisher".into()],
                    ..Default::default()
                }),
                _ => Err(AuthError::MissingKeyId),
            }
        }
    }

    fn anonymous(method: &'static MethodInfo, token: Option<&str>) -> Context {
        let mut md = MetadataMap::new();
        if let Some(token) = token {
            md.insert("authorization", format!("Bearer {token}").parse().unwrap());
        }
        Context::new(method, md, None, CancellationToken::new())
    }

    fn counting(calls: Arc<AtomicUsize>) -> Next<String> {
        handler(move |ctx: Context| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.claims().map(|c| c.sub.clone()).unwrap_or_default())
        })
    }

    #[tokio::test]
    async fn test_auth_gate() {
        let chain = Chain::for_node(false, Arc::new(StaticTokens));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = chain
            .run(anonymous(&methods::INFO, None), counting(calls.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), "missing credentials");

        let err = chain
            .run(anonymous(&methods::INFO, Some("bad")), counting(calls.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), "invalid credentials");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let sub = chain
            .run(anonymous(&methods::INFO, Some("good")), counting(calls.clone()))
            .await
            .unwrap();
        assert_eq!(sub, "tester");

        // Public methods skip authentication entirely.
        let sub = chain
            .run(anonymous(&methods::STATUS, None), counting(calls.clone()))
            .await
            .unwrap();
        assert_eq!(sub, "");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_maintenance_gate() {
        let chain = Chain::for_node(true, Arc::new(StaticTokens));
        let names: Vec<_> = chain.interceptors().iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["monitoring", "recovery", "maintenance"]);

        let calls = Arc::new(AtomicUsize::new(0));
        for method in [&methods::PUBLISH, &methods::INFO, &methods::ENSQL] {
            let err = chain
                .run(context(method, &["publisher"]), counting(calls.clone()))
                .await
                .unwrap_err();
            assert_eq!(err.code(), Code::Unavailable);
            assert!(err.message().contains("maintenance"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        for method in [&methods::STATUS, &methods::HEALTH_CHECK, &methods::HEALTH_WATCH] {
            chain
                .run(anonymous(method, None), counting(calls.clone()))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovery_in_chain() {
        let chain = Chain::for_node(false, Arc::new(StaticTokens));
        let err = chain
            .run(
                anonymous(&methods::INFO, Some("good")),
                handler(|_ctx: Context| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.message(), recovery::UNHANDLED);
    }

    #[tokio::test]
    async fn test_order() {
        // Authentication runs inside recovery, so a panicking authenticator is
        // still translated into an internal error.
        struct Panics;

        #[async_trait]
        impl Authenticator for Panics {
            async fn authenticate(&self, _: &str) -> Result<Claims, AuthError> {
                panic!("authenticator exploded")
            }
        }

        let chain = Chain::for_node(false, Arc::new(Panics));
        let err = chain
            .run(
                anonymous(&methods::INFO, Some("good")),
                counting(Arc::new(AtomicUsize::new(0))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
