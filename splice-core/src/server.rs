//! # Service Registrar
//!
//! [`ProxyServer`] puts the [`StreamProxy`] behind a `tonic` server. Each call is
//! dispatched on its path and content type:
//!
//! 1. A call whose path is not `/package.Service/Method` is answered with `Unimplemented`.
//! 2. A call to a typed service mounted with [`ProxyServerBuilder::add_service`] is served
//!    locally, unless it negotiates the proxy content subtype
//!    ([`ProxyConfig::content_subtype`]).
//! 3. A call to a method registered with [`ProxyServerBuilder::register_service`] is proxied.
//! 4. Any other call is proxied by the catch-all handler, or answered with `Unimplemented`
//!    when the catch-all is disabled.
//!
//! The content subtype never widens what is proxied: with the catch-all disabled only
//! registered methods reach the director. Explicit and catch-all calls run the very same
//! handler.
//!
//! ```rust,no_run
//! # async fn serve() -> Result<(), Box<dyn std::error::Error>> {
//! use splice_core::{CallContext, ProxyServer, Route, RouteDecision};
//! use tonic::transport::{Channel, Server};
//!
//! let backend = Channel::from_static("http://[::1]:50051").connect_lazy();
//! let director = move |ctx: &CallContext, _: &str| -> RouteDecision<Channel> {
//!     Ok(Route::new(ctx.outgoing(), backend.clone()))
//! };
//!
//! let proxy = ProxyServer::builder(director)
//!     .register_service("ping.v1.TestService", &["Ping", "PingStream"])?
//!     .catch_all(false)
//!     .build();
//!
//! Server::builder()
//!     .add_routes(proxy.into_routes())
//!     .serve("[::1]:8080".parse()?)
//!     .await?;
//! # Ok(())
//! # }
//! ```
use crate::{
    BoxError,
    codec::content_subtype,
    config::ProxyConfig,
    director::{Director, split_full_method},
    proxy::StreamProxy,
};
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http_body::Body as HttpBody;
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{Status, body::Body, server::NamedService, service::Routes};
use tower::{Service, ServiceExt, util::BoxCloneSyncService};

type LocalService = BoxCloneSyncService<http::Request<Body>, http::Response<Body>, Infallible>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("method /{service}/{method} is already registered")]
    DuplicateMethod { service: String, method: String },
    #[error("service '{0}' is already mounted")]
    DuplicateService(String),
    #[error("method /{service}/{method} belongs to the mounted service '{service}'")]
    MethodOfLocalService { service: String, method: String },
    #[error("service and method names must not be empty")]
    EmptyName,
}

/// A `tower` service dispatching gRPC calls between the stream proxy and typed services.
pub struct ProxyServer<D> {
    proxy: StreamProxy<D>,
    explicit: Arc<HashSet<String>>,
    local: Arc<HashMap<String, LocalService>>,
    catch_all: bool,
}

impl<D> Clone for ProxyServer<D> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            explicit: Arc::clone(&self.explicit),
            local: Arc::clone(&self.local),
            catch_all: self.catch_all,
        }
    }
}

enum Dispatch {
    Proxy,
    Local(LocalService),
    Unimplemented,
}

impl<D: Director> ProxyServer<D> {
    pub fn builder(director: D) -> ProxyServerBuilder<D> {
        ProxyServerBuilder {
            director: Arc::new(director),
            config: ProxyConfig::default(),
            explicit: HashSet::new(),
            local: HashMap::new(),
            catch_all: true,
        }
    }

    pub fn proxy(&self) -> &StreamProxy<D> {
        &self.proxy
    }

    /// Adapts the server to [`Routes`], ready for `tonic::transport::Server::add_routes`.
    pub fn into_routes(self) -> Routes {
        Routes::from(axum::Router::new().fallback_service(self))
    }

    fn dispatch(&self, headers: &http::HeaderMap, path: &str) -> Dispatch {
        let Some((service, _)) = split_full_method(path) else {
            return Dispatch::Unimplemented;
        };

        let opted_in =
            content_subtype(headers) == Some(self.proxy.config().content_subtype.as_str());
        let proxied = self.catch_all || self.explicit.contains(path);

        match self.local.get(service) {
            Some(local) if !opted_in => Dispatch::Local(local.clone()),
            _ if proxied => Dispatch::Proxy,
            _ => Dispatch::Unimplemented,
        }
    }
}

impl<D, B> Service<http::Request<B>> for ProxyServer<D>
where
    D: Director,
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        match self.dispatch(request.headers(), request.uri().path()) {
            Dispatch::Proxy => self.proxy.handle(request).map(Ok).boxed(),
            Dispatch::Local(service) => service.oneshot(request.map(Body::new)).boxed(),
            Dispatch::Unimplemented => {
                tracing::debug!(path = request.uri().path(), "no handler for call");
                let status = Status::unimplemented(format!(
                    "method {} is not served here",
                    request.uri().path()
                ));
                futures_util::future::ready(Ok(status.into_http())).boxed()
            }
        }
    }
}

pub struct ProxyServerBuilder<D> {
    director: Arc<D>,
    config: ProxyConfig,
    explicit: HashSet<String>,
    local: HashMap<String, LocalService>,
    catch_all: bool,
}

impl<D: Director> ProxyServerBuilder<D> {
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Routes the given methods of `service` through the proxy.
    pub fn register_service(mut self, service: &str, methods: &[&str]) -> Result<Self, RegistrarError> {
        if service.is_empty() {
            return Err(RegistrarError::EmptyName);
        }

        for method in methods {
            if method.is_empty() {
                return Err(RegistrarError::EmptyName);
            }
            if self.local.contains_key(service) {
                return Err(RegistrarError::MethodOfLocalService {
                    service: service.to_string(),
                    method: method.to_string(),
                });
            }
            if !self.explicit.insert(format!("/{service}/{method}")) {
                return Err(RegistrarError::DuplicateMethod {
                    service: service.to_string(),
                    method: method.to_string(),
                });
            }
        }

        Ok(self)
    }

    /// Whether calls to unregistered methods are proxied. Enabled by default.
    pub fn catch_all(mut self, enabled: bool) -> Self {
        self.catch_all = enabled;
        self
    }

    /// Mounts a typed `tonic` service, served locally on the same listener.
    pub fn add_service<S>(mut self, service: S) -> Result<Self, RegistrarError>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let name = S::NAME;
        if self.local.contains_key(name) {
            return Err(RegistrarError::DuplicateService(name.to_string()));
        }

        let prefix = format!("/{name}/");
        if let Some(method) = self
            .explicit
            .iter()
            .find_map(|path| path.strip_prefix(&prefix))
        {
            return Err(RegistrarError::MethodOfLocalService {
                service: name.to_string(),
                method: method.to_string(),
            });
        }

        self.local
            .insert(name.to_string(), BoxCloneSyncService::new(service));
        Ok(self)
    }

    pub fn build(self) -> ProxyServer<D> {
        tracing::debug!(
            explicit = self.explicit.len(),
            local = self.local.len(),
            catch_all = self.catch_all,
            "proxy server built"
        );

        ProxyServer {
            proxy: StreamProxy::from_shared(self.director, self.config),
            explicit: Arc::new(self.explicit),
            local: Arc::new(self.local),
            catch_all: self.catch_all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::CallContext, director::RouteDecision};
    use http::header::{CONTENT_TYPE, HeaderValue};
    use ping_service::{SERVICE_NAME, TestServiceServer};
    use tonic::transport::Channel;

    // Mounted only to be routed to, never called.
    struct Unused;

    #[tonic::async_trait]
    impl ping_service::TestService for Unused {
        async fn ping_empty(
            &self,
            _: tonic::Request<ping_service::pb::Empty>,
        ) -> Result<tonic::Response<ping_service::pb::PingResponse>, Status> {
            Err(Status::internal("unused"))
        }

        async fn ping(
            &self,
            _: tonic::Request<ping_service::pb::PingRequest>,
        ) -> Result<tonic::Response<ping_service::pb::PingResponse>, Status> {
            Err(Status::internal("unused"))
        }

        async fn ping_error(
            &self,
            _: tonic::Request<ping_service::pb::PingRequest>,
        ) -> Result<tonic::Response<ping_service::pb::Empty>, Status> {
            Err(Status::internal("unused"))
        }

        type PingListStream = tokio_stream::Empty<Result<ping_service::pb::PingResponse, Status>>;

        async fn ping_list(
            &self,
            _: tonic::Request<ping_service::pb::PingRequest>,
        ) -> Result<tonic::Response<Self::PingListStream>, Status> {
            Err(Status::internal("unused"))
        }

        type PingStreamStream = tokio_stream::Empty<Result<ping_service::pb::PingResponse, Status>>;

        async fn ping_stream(
            &self,
            _: tonic::Request<tonic::Streaming<ping_service::pb::PingRequest>>,
        ) -> Result<tonic::Response<Self::PingStreamStream>, Status> {
            Err(Status::internal("unused"))
        }
    }

    fn reject(_: &CallContext, _: &str) -> RouteDecision<Channel> {
        Err(Status::permission_denied("no"))
    }

    fn request(path: &str, content_type: &'static str) -> http::Request<Body> {
        let mut request = http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        request
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let err = ProxyServer::builder(reject)
            .register_service("ping.v1.TestService", &["Ping"])
            .unwrap()
            .register_service("ping.v1.TestService", &["PingList", "Ping"])
            .err();
        assert_eq!(
            err,
            Some(RegistrarError::DuplicateMethod {
                service: "ping.v1.TestService".into(),
                method: "Ping".into()
            })
        );

        let err = ProxyServer::builder(reject)
            .add_service(TestServiceServer::new(Unused))
            .unwrap()
            .add_service(TestServiceServer::new(Unused))
            .err();
        assert_eq!(err, Some(RegistrarError::DuplicateService(SERVICE_NAME.into())));
    }

    #[test]
    fn methods_of_mounted_services_cannot_be_proxied() {
        let err = ProxyServer::builder(reject)
            .add_service(TestServiceServer::new(Unused))
            .unwrap()
            .register_service(SERVICE_NAME, &["Ping"])
            .err();
        assert!(matches!(err, Some(RegistrarError::MethodOfLocalService { .. })));

        let err = ProxyServer::builder(reject)
            .register_service(SERVICE_NAME, &["Ping"])
            .unwrap()
            .add_service(TestServiceServer::new(Unused))
            .err();
        assert_eq!(
            err,
            Some(RegistrarError::MethodOfLocalService {
                service: SERVICE_NAME.into(),
                method: "Ping".into()
            })
        );
    }

    #[test]
    fn empty_names_are_rejected() {
        let err = ProxyServer::builder(reject).register_service("", &["Ping"]).err();
        assert_eq!(err, Some(RegistrarError::EmptyName));

        let err = ProxyServer::builder(reject)
            .register_service(SERVICE_NAME, &[""])
            .err();
        assert_eq!(err, Some(RegistrarError::EmptyName));
    }

    #[test]
    fn calls_are_dispatched_on_path_and_subtype() {
        let server = ProxyServer::builder(reject)
            .register_service("proxied.Service", &["Call"])
            .unwrap()
            .add_service(TestServiceServer::new(Unused))
            .unwrap()
            .catch_all(false)
            .build();

        let dispatch = |path: &str, content_type: &'static str| {
            let request = request(path, content_type);
            server.dispatch(request.headers(), request.uri().path())
        };

        let local = format!("/{SERVICE_NAME}/Ping");
        assert!(matches!(dispatch(&local, "application/grpc"), Dispatch::Local(_)));
        assert!(matches!(
            dispatch(&local, "application/grpc+grpcproxy"),
            Dispatch::Proxy
        ));
        assert!(matches!(
            dispatch("/proxied.Service/Call", "application/grpc"),
            Dispatch::Proxy
        ));
        assert!(matches!(
            dispatch("/proxied.Service/Other", "application/grpc"),
            Dispatch::Unimplemented
        ));
        assert!(matches!(
            dispatch("/proxied.Service/Call", "application/grpc+grpcproxy"),
            Dispatch::Proxy
        ));
        assert!(matches!(
            dispatch("/proxied.Service/Other", "application/grpc+grpcproxy"),
            Dispatch::Unimplemented
        ));
        assert!(matches!(dispatch("/", "application/grpc"), Dispatch::Unimplemented));
        assert!(matches!(
            dispatch("/a/b/c", "application/grpc+grpcproxy"),
            Dispatch::Unimplemented
        ));
    }

    #[tokio::test]
    async fn the_proxy_subtype_does_not_bypass_a_disabled_catch_all() {
        let routed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&routed);
        let director = move |_: &CallContext, _: &str| -> RouteDecision<Channel> {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(Status::permission_denied("no"))
        };
        let mut server = ProxyServer::builder(director).catch_all(false).build();

        for path in [&format!("/{SERVICE_NAME}/Ping")[..], "/a/b/c"] {
            let response = server
                .call(request(path, "application/grpc+grpcproxy"))
                .await
                .unwrap();
            let status = Status::from_header_map(response.headers()).unwrap();
            assert_eq!(status.code(), tonic::Code::Unimplemented);
        }
        assert_eq!(routed.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unlisted_methods_are_unimplemented_without_catch_all() {
        let mut server = ProxyServer::builder(reject).catch_all(false).build();

        let response = server
            .call(request("/unknown.Service/Call", "application/grpc"))
            .await
            .unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();

        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }
}
