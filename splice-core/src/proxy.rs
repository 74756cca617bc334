//! # Stream Proxy
//!
//! The call-forwarding engine. Every inbound call, whatever its RPC shape, is handled as a
//! duplex stream of opaque [`Frame`]s:
//!
//! 1. **Routing**: the [`Director`] is asked once where the call goes. A rejection is
//!    returned to the caller as is and no backend is contacted.
//! 2. **Streaming**: a backend call is opened and two pumps are spawned, caller → backend
//!    and backend → caller. The backend's response headers become the caller's response
//!    headers.
//! 3. **Draining**: once the backend terminates, its status and trailers are captured and
//!    the caller → backend pump is stopped.
//! 4. **Closed** / **Failed**: the terminal status and trailers are flushed to the caller.
//!
//! Backend statuses are forwarded verbatim, so a caller cannot tell a proxied failure from
//! a direct one. Cancellation of the caller, or its deadline expiring, resets the backend
//! call.
mod pump;
mod state;

pub use state::Phase;

use crate::{
    BoxError,
    codec::{Frame, FrameCodec},
    config::ProxyConfig,
    context::{CallContext, forwardable_metadata},
    director::{Director, Route, split_full_method},
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::uri::PathAndQuery;
use http_body::Body as HttpBody;
use pump::BackendCodec;
use state::{CallSignal, CallState};
use std::{future::Future, str::FromStr, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Extensions, Request, Response, Status, Streaming,
    body::Body,
    server::{Grpc, StreamingService},
};
use tracing::Instrument;

/// Ways a proxied call can fail.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("director rejected the call: {}", .0.message())]
    RoutingRejected(Status),
    #[error("backend unreachable: {0}")]
    BackendUnreachable(#[source] BoxError),
    #[error("backend failed the call with {:?}: {}", .0.code(), .0.message())]
    BackendApplication(Status),
    #[error("transport failure ({:?}): {}", .0.code(), .0.message())]
    Transport(Status),
    #[error("call was cancelled")]
    Cancelled,
    #[error("deadline expired before the call completed")]
    DeadlineExceeded,
}

impl ProxyError {
    /// Classifies a status received from the backend leg.
    ///
    /// Statuses synthesized by the client transport carry the underlying error as their
    /// source; statuses sent by the backend itself do not.
    pub fn from_backend(status: Status) -> Self {
        if std::error::Error::source(&status).is_some() {
            ProxyError::Transport(status)
        } else {
            ProxyError::BackendApplication(status)
        }
    }
}

impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::RoutingRejected(status)
            | ProxyError::BackendApplication(status)
            | ProxyError::Transport(status) => status,
            ProxyError::BackendUnreachable(source) => {
                Status::unavailable(format!("backend unreachable: {source}"))
            }
            ProxyError::Cancelled => Status::cancelled("call was cancelled"),
            ProxyError::DeadlineExceeded => {
                Status::deadline_exceeded("deadline expired before the call completed")
            }
        }
    }
}

/// The stream proxy: forwards calls to the backends chosen by a [`Director`].
pub struct StreamProxy<D> {
    director: Arc<D>,
    config: ProxyConfig,
}

impl<D> Clone for StreamProxy<D> {
    fn clone(&self) -> Self {
        Self {
            director: Arc::clone(&self.director),
            config: self.config.clone(),
        }
    }
}

impl<D: Director> StreamProxy<D> {
    pub fn new(director: D) -> Self {
        Self::from_shared(Arc::new(director), ProxyConfig::default())
    }

    pub fn from_shared(director: Arc<D>, config: ProxyConfig) -> Self {
        Self { director, config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Proxies one HTTP/2 gRPC request.
    pub fn handle<B>(
        &self,
        request: http::Request<B>,
    ) -> impl Future<Output = http::Response<Body>> + Send + use<D, B>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let full_method = request.uri().path().to_owned();
        let span = tracing::debug_span!("proxy_call", method = %full_method);

        let call = ProxyCall {
            director: Arc::clone(&self.director),
            config: self.config.clone(),
            full_method,
        };
        let mut grpc = Grpc::new(FrameCodec).apply_max_message_size_config(
            self.config.max_decoding_message_size,
            self.config.max_encoding_message_size,
        );

        async move { grpc.streaming(call, request).await }.instrument(span)
    }
}

/// One inbound call, as seen by `tonic`'s streaming server.
struct ProxyCall<D> {
    director: Arc<D>,
    config: ProxyConfig,
    full_method: String,
}

impl<D: Director> StreamingService<Frame> for ProxyCall<D> {
    type Response = Frame;
    type ResponseStream = ReceiverStream<Result<Frame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let director = Arc::clone(&self.director);
        let config = self.config.clone();
        let state = CallState::new(self.full_method.clone());

        Box::pin(async move {
            proxy_call(director, config, state, request)
                .await
                .map_err(Status::from)
        })
    }
}

async fn proxy_call<D: Director>(
    director: Arc<D>,
    config: ProxyConfig,
    mut state: CallState,
    request: Request<Streaming<Frame>>,
) -> Result<Response<ReceiverStream<Result<Frame, Status>>>, ProxyError> {
    let (metadata, _, inbound) = request.into_parts();
    let ctx = CallContext::from_inbound(metadata);
    let deadline = ctx.deadline();
    // Every task derived from the call context stops with the call.
    let call_scope = ctx.cancellation().clone().drop_guard();

    let path = match split_full_method(state.method()) {
        Some(_) => PathAndQuery::from_str(state.method()).ok(),
        None => None,
    };
    let Some(path) = path else {
        state.transition(Phase::Rejected);
        return Err(ProxyError::RoutingRejected(Status::unimplemented(
            "malformed method path",
        )));
    };

    state.transition(Phase::Routing);
    let decision = until_deadline(deadline, director.route(&ctx, state.method())).await;
    let route = match decision {
        Ok(Ok(route)) => route,
        Ok(Err(status)) => {
            state.transition(Phase::Rejected);
            tracing::debug!(
                code = ?status.code(),
                message = status.message(),
                "director rejected the call"
            );
            return Err(ProxyError::RoutingRejected(status));
        }
        Err(err) => {
            // The deadline expired while routing.
            state.transition(Phase::Failed);
            return Err(err);
        }
    };
    let Route {
        context: outgoing,
        backend,
    } = route;

    state.transition(Phase::Streaming);

    let mut client = tonic::client::Grpc::new(backend);
    if let Some(limit) = config.max_decoding_message_size {
        client = client.max_decoding_message_size(limit);
    }
    if let Some(limit) = config.max_encoding_message_size {
        client = client.max_encoding_message_size(limit);
    }

    if let Err(err) = until_deadline(deadline, client.ready()).await.and_then(|ready| {
        ready.map_err(|err| ProxyError::BackendUnreachable(err.into()))
    }) {
        state.transition(Phase::Failed);
        return Err(err);
    }

    let signal = CallSignal::new(outgoing.cancellation().child_token());
    let stop_guard = signal.stop_on_drop();

    let (frames_tx, frames_rx) = mpsc::channel(1);
    let (abort_tx, abort_rx) = oneshot::channel();
    let upstream = tokio::spawn(
        pump::forward_requests(inbound, frames_tx, abort_tx, signal.clone(), deadline)
            .in_current_span(),
    );

    let mut backend_request = Request::from_parts(
        forwardable_metadata(outgoing.metadata()),
        Extensions::default(),
        pump::outbound_stream(frames_rx, abort_rx),
    );
    if let Some(timeout) = outgoing.timeout() {
        backend_request.set_timeout(timeout);
    }

    let response = tokio::select! {
        biased;
        _ = signal.stopped() => Err(signal.failure_or_cancelled()),
        _ = pump::deadline_elapsed(deadline) => Err(pump::deadline_exceeded()),
        response = client.streaming(backend_request, path, BackendCodec) => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(status) => {
            signal.fail(status.clone());
            if let Err(err) = upstream.await {
                tracing::error!(error = %err, "caller stream pump panicked");
            }
            state.transition(Phase::Failed);
            let err = ProxyError::from_backend(status);
            tracing::warn!(error = %err, "backend call failed before responding");
            return Err(err);
        }
    };

    let (headers, backend_stream, _) = response.into_parts();
    let (caller_tx, caller_rx) = mpsc::channel(1);

    state.headers_flushed();
    tokio::spawn(
        pump::forward_responses(
            backend_stream,
            caller_tx,
            upstream,
            signal,
            deadline,
            state,
            call_scope,
        )
        .in_current_span(),
    );
    let _ = stop_guard.disarm();

    Ok(Response::from_parts(
        forwardable_metadata(&headers),
        ReceiverStream::new(caller_rx),
        Extensions::default(),
    ))
}

async fn until_deadline<F: Future>(
    deadline: Option<Instant>,
    future: F,
) -> Result<F::Output, ProxyError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future)
            .await
            .map_err(|_| ProxyError::DeadlineExceeded),
        None => Ok(future.await),
    }
}
