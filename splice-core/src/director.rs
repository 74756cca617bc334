//! # Director
//!
//! The [`Director`] decides, once per call and before any message is forwarded, where a
//! call goes. It sees the call's [`CallContext`] and its full method name
//! (`/package.Service/Method`) and answers with either a [`Route`] or a rejection
//! [`Status`] which is relayed to the caller unchanged.
//!
//! Directors are shared by every call handled by a server, so they are invoked
//! concurrently. Any shared mutable state (routing tables, policy caches) is the
//! director's to synchronize.
//!
//! ## Example
//!
//! ```rust,no_run
//! use splice_core::{CallContext, Route, RouteDecision};
//! use tonic::{Status, transport::Channel};
//!
//! fn director(backend: Channel) -> impl Fn(&CallContext, &str) -> RouteDecision<Channel> {
//!     move |ctx, method| {
//!         if method.starts_with("/internal.") {
//!             return Err(Status::permission_denied("internal services are not exposed"));
//!         }
//!         Ok(Route::new(ctx.outgoing(), backend.clone()))
//!     }
//! }
//! ```
use crate::{BoxError, context::CallContext};
use bytes::Bytes;
use http_body::Body as HttpBody;
use std::future::{Future, ready};
use tonic::{Status, client::GrpcService};

/// A destination a call can be forwarded to.
///
/// Implemented for every `tonic` gRPC service meeting these bounds, such as a
/// [`tonic::transport::Channel`] or a generated server used in-process.
pub trait Backend:
    GrpcService<
        tonic::body::Body,
        Error: Into<BoxError>,
        Future: Send,
        ResponseBody: HttpBody<Data = Bytes, Error: Into<BoxError> + Send> + Send + 'static,
    > + Send
    + 'static
{
}

impl<T> Backend for T
where
    T: GrpcService<tonic::body::Body> + Send + 'static,
    T::Error: Into<BoxError>,
    T::Future: Send,
    T::ResponseBody: HttpBody<Data = Bytes> + Send + 'static,
    <T::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
}

/// Where a call is forwarded: the context of the backend call and its destination.
#[derive(Debug, Clone)]
pub struct Route<B> {
    pub context: CallContext,
    pub backend: B,
}

impl<B> Route<B> {
    pub fn new(context: CallContext, backend: B) -> Self {
        Self { context, backend }
    }
}

/// The outcome of routing one call.
pub type RouteDecision<B> = Result<Route<B>, Status>;

/// Routes calls to backends.
pub trait Director: Send + Sync + 'static {
    type Backend: Backend;

    fn route(
        &self,
        ctx: &CallContext,
        full_method: &str,
    ) -> impl Future<Output = RouteDecision<Self::Backend>> + Send;
}

impl<F, B> Director for F
where
    F: Fn(&CallContext, &str) -> RouteDecision<B> + Send + Sync + 'static,
    B: Backend,
{
    type Backend = B;

    fn route(
        &self,
        ctx: &CallContext,
        full_method: &str,
    ) -> impl Future<Output = RouteDecision<B>> + Send {
        ready(self(ctx, full_method))
    }
}

/// Splits a full method name (`/package.Service/Method`) into service and method.
pub fn split_full_method(full_method: &str) -> Option<(&str, &str)> {
    let (service, method) = full_method.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}
