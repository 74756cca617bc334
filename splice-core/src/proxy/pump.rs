//! The two directions of a splice.
//!
//! Each pump owns the stream it reads from and a capacity-one channel towards the
//! other side, so at most one frame per direction is in flight. Every wait is raced
//! against the [`CallSignal`] and the caller's deadline.
use super::{
    ProxyError,
    state::{CallSignal, CallState, Phase},
};
use crate::{
    codec::{Frame, FrameDecoder},
    context::forwardable_metadata,
};
use futures_util::{
    Stream, StreamExt,
    future,
    stream::{self, PollNext},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tonic::{
    Code, Status, Streaming,
    codec::{Codec, EncodeBuf, Encoder},
};

/// An item of the backend request stream.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// Fails the request body, which resets the backend stream instead of half-closing it.
    ///
    /// hyper resets the stream with `INTERNAL_ERROR` rather than `CANCEL`, so backends
    /// log an internal stream error for a cancelled caller.
    Abort(Status),
}

/// The codec of the backend leg: frames in both directions, plus the abort marker.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BackendCodec;

impl Codec for BackendCodec {
    type Encode = Outbound;
    type Decode = Frame;

    type Encoder = OutboundEncoder;
    type Decoder = FrameDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        OutboundEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        FrameDecoder
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OutboundEncoder;

impl Encoder for OutboundEncoder {
    type Item = Outbound;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            Outbound::Frame(frame) => {
                frame.write_to(dst);
                Ok(())
            }
            Outbound::Abort(status) => Err(status),
        }
    }
}

/// The body of the backend request.
///
/// An abort always takes precedence over frames still waiting in the channel. The
/// stream ends, half-closing the backend leg, once the frame channel is closed.
pub(crate) fn outbound_stream(
    frames: mpsc::Receiver<Frame>,
    abort: oneshot::Receiver<Status>,
) -> impl Stream<Item = Outbound> + Send + 'static {
    let abort = stream::once(abort)
        .filter_map(|received| future::ready(received.ok().map(Outbound::Abort)));
    let frames = ReceiverStream::new(frames).map(Outbound::Frame);

    stream::select_with_strategy(abort, frames, |_: &mut ()| PollNext::Left)
}

pub(crate) fn deadline_exceeded() -> Status {
    ProxyError::DeadlineExceeded.into()
}

pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Caller → backend.
///
/// Forwards inbound frames until the caller half-closes. Any failure, or the call being
/// stopped, resets the backend request stream.
pub(crate) async fn forward_requests(
    mut inbound: Streaming<Frame>,
    frames: mpsc::Sender<Frame>,
    abort: oneshot::Sender<Status>,
    signal: CallSignal,
    deadline: Option<Instant>,
) {
    let mut forwarded = 0usize;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = signal.stopped() => break Err(signal.failure_or_cancelled()),
            _ = deadline_elapsed(deadline) => {
                let status = deadline_exceeded();
                signal.fail(status.clone());
                break Err(status);
            }
            message = inbound.message() => message,
        };

        match next {
            Ok(Some(frame)) => {
                tokio::select! {
                    biased;
                    _ = signal.stopped() => break Err(signal.failure_or_cancelled()),
                    _ = deadline_elapsed(deadline) => {
                        let status = deadline_exceeded();
                        signal.fail(status.clone());
                        break Err(status);
                    }
                    sent = frames.send(frame) => {
                        // The backend dropped its request body: that leg is over and the
                        // other pump reports how it ended.
                        if sent.is_err() {
                            break Ok(());
                        }
                        forwarded += 1;
                    }
                }
            }
            Ok(None) => break Ok(()),
            Err(status) => {
                tracing::debug!(error = %ProxyError::Transport(status.clone()), "caller stream failed");
                signal.fail(status.clone());
                break Err(status);
            }
        }
    };

    match outcome {
        Ok(()) => tracing::trace!(forwarded, "caller finished sending"),
        Err(status) => {
            tracing::trace!(forwarded, code = ?status.code(), "resetting backend request stream");
            // Nobody is left to receive an abort once the backend request body is gone.
            let _ = abort.send(status);
        }
    }
}

/// Backend → caller.
///
/// Forwards backend frames until the backend terminates, then drains the call: stops and
/// joins the caller → backend pump and flushes the terminal status and trailers once.
pub(crate) async fn forward_responses(
    mut backend: Streaming<Frame>,
    caller: mpsc::Sender<Result<Frame, Status>>,
    upstream: JoinHandle<()>,
    signal: CallSignal,
    deadline: Option<Instant>,
    mut state: CallState,
    _call_scope: DropGuard,
) {
    let mut forwarded = 0usize;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = caller.closed() => {
                let status: Status = ProxyError::Cancelled.into();
                signal.fail(status.clone());
                break Err(status);
            }
            _ = signal.stopped() => break Err(signal.failure_or_cancelled()),
            _ = deadline_elapsed(deadline) => {
                let status = deadline_exceeded();
                signal.fail(status.clone());
                break Err(status);
            }
            message = backend.message() => message,
        };

        match next {
            Ok(Some(frame)) => {
                tokio::select! {
                    biased;
                    _ = signal.stopped() => break Err(signal.failure_or_cancelled()),
                    _ = deadline_elapsed(deadline) => {
                        let status = deadline_exceeded();
                        signal.fail(status.clone());
                        break Err(status);
                    }
                    sent = caller.send(Ok(frame)) => {
                        if sent.is_err() {
                            let status: Status = ProxyError::Cancelled.into();
                            signal.fail(status.clone());
                            break Err(status);
                        }
                        forwarded += 1;
                    }
                }
            }
            Ok(None) => {
                state.transition(Phase::Draining);
                match backend.trailers().await {
                    Ok(trailers) => break Ok(trailers.unwrap_or_default()),
                    Err(status) => {
                        signal.fail(status.clone());
                        break Err(status);
                    }
                }
            }
            Err(status) => {
                tracing::debug!(error = %ProxyError::from_backend(status.clone()), "backend stream failed");
                signal.fail(status.clone());
                break Err(status);
            }
        }
    };

    if state.phase() != Phase::Draining {
        state.transition(Phase::Draining);
    }

    // The backend leg is over: whatever the caller still sends has no destination.
    signal.finish();
    drop(backend);
    if let Err(err) = upstream.await {
        tracing::error!(error = %err, "caller stream pump panicked");
    }

    match outcome {
        Ok(trailers) => {
            state.set_trailers(forwardable_metadata(&trailers));
            state.transition(Phase::Closed);
            tracing::debug!(method = %state.method(), forwarded, "call closed");

            let trailers = state.take_trailers();
            if !trailers.is_empty() {
                // An `Ok` status is sent as the trailers of the response, carrying the
                // backend's custom trailing metadata.
                let _ = caller
                    .send(Err(Status::with_metadata(Code::Ok, "", trailers)))
                    .await;
            }
        }
        Err(status) => {
            state.transition(Phase::Failed);
            tracing::warn!(
                method = %state.method(),
                forwarded,
                headers_flushed = state.are_headers_flushed(),
                code = ?status.code(),
                message = status.message(),
                "call failed"
            );
            let _ = caller.send(Err(status)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_stream_ends_when_the_caller_half_closes() {
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (abort_tx, abort_rx) = oneshot::channel::<Status>();
        let mut outbound = Box::pin(outbound_stream(frames_rx, abort_rx));

        frames_tx.send(Frame::new(&b"first"[..])).await.unwrap();
        match outbound.next().await {
            Some(Outbound::Frame(frame)) => assert_eq!(&frame.payload()[..], b"first"),
            other => panic!("expected a frame, got {other:?}"),
        }

        drop(abort_tx);
        drop(frames_tx);
        assert!(outbound.next().await.is_none());
    }

    #[tokio::test]
    async fn abort_overtakes_queued_frames() {
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (abort_tx, abort_rx) = oneshot::channel();
        let mut outbound = Box::pin(outbound_stream(frames_rx, abort_rx));

        frames_tx.send(Frame::new(&b"queued"[..])).await.unwrap();
        abort_tx.send(Status::cancelled("caller went away")).unwrap();

        match outbound.next().await {
            Some(Outbound::Abort(status)) => assert_eq!(status.code(), Code::Cancelled),
            other => panic!("expected an abort, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_deadline_never_elapses() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_secs(3600),
            deadline_elapsed(None),
        )
        .await;
        assert!(elapsed.is_err());

        deadline_elapsed(Some(Instant::now() + std::time::Duration::from_secs(1))).await;
    }
}
