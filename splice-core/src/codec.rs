//! # Raw Frame Codec
//!
//! This module implements `tonic::codec::Codec` so that `tonic` can transport gRPC messages
//! as opaque byte frames, bypassing the need for generated Rust structs or any schema.
//!
//! ## How it works
//!
//! 1. **[`FrameCodec`]**: the opaque path used by the proxy on both legs of a call.
//!    - The decoder takes the message bytes out of the transport buffer as a [`Frame`].
//!    - The encoder writes the stored bytes back unchanged.
//!
//! 2. **[`RawCodec`]**: the codec offered to other call sites sharing the listener.
//!    - Values are a tagged [`Payload`], either an opaque [`Frame`] or a typed message.
//!    - Typed messages are delegated to a fallback codec ([`ProstCodec`] by default).
//!    - Which variant is decoded is chosen by the call site with [`DecodeAs`].
//!
//! Callers opt in to proxying by requesting the [`RawCodec::NAME`] content subtype,
//! see [`ContentSubtype`].
use bytes::{Buf, BufMut, Bytes};
use http::header::{CONTENT_TYPE, HeaderValue, InvalidHeaderValue};
use std::task::{Context, Poll};
use tonic::{
    Status,
    codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};
use tonic_prost::ProstCodec;

/// Content type sent by every gRPC call.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// One undecoded gRPC message.
///
/// The bytes are never parsed, validated or mutated; a frame is forwarded exactly as it
/// was received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Takes every remaining byte of `src` as the payload of a new frame.
    ///
    /// For `tonic`'s decode buffer this splits the underlying buffer instead of copying it.
    pub fn from_buf(src: &mut impl Buf) -> Self {
        Self {
            payload: src.copy_to_bytes(src.remaining()),
        }
    }

    /// Writes the payload, unchanged, into `dst`.
    pub fn write_to(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.payload);
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

/// A codec moving [`Frame`]s in and out of the wire untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Codec for FrameCodec {
    type Encode = Frame;
    type Decode = Frame;

    type Encoder = FrameEncoder;
    type Decoder = FrameDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        FrameEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        FrameDecoder
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl Encoder for FrameEncoder {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(Frame::from_buf(src)))
    }
}

/// A value moved by [`RawCodec`]: either an opaque frame or a message for the fallback codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    Frame(Frame),
    Typed(T),
}

impl<T> Payload<T> {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Payload::Frame(frame) => Some(frame),
            Payload::Typed(_) => None,
        }
    }

    pub fn into_typed(self) -> Option<T> {
        match self {
            Payload::Typed(value) => Some(value),
            Payload::Frame(_) => None,
        }
    }
}

/// How a [`RawCodec`] decodes incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeAs {
    /// Keep every message as an opaque [`Frame`].
    Frame,
    /// Hand every message to the fallback codec.
    #[default]
    Typed,
}

/// A codec treating [`Frame`]s as literal bytes and delegating everything else to
/// a fallback codec.
#[derive(Debug, Clone)]
pub struct RawCodec<C> {
    fallback: C,
    decode_as: DecodeAs,
}

impl<T, U> RawCodec<ProstCodec<T, U>> {
    /// Creates a codec with the protobuf codec as fallback, decoding typed messages.
    pub fn new() -> Self {
        Self::with_fallback(ProstCodec::default())
    }
}

impl<T, U> Default for RawCodec<ProstCodec<T, U>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RawCodec<C> {
    /// Name under which the codec is negotiated as a gRPC content subtype.
    pub const NAME: &'static str = "grpcproxy";

    /// Name of the default fallback codec.
    pub const FALLBACK_NAME: &'static str = "proto";

    pub fn with_fallback(fallback: C) -> Self {
        Self {
            fallback,
            decode_as: DecodeAs::Typed,
        }
    }

    /// Sets how incoming messages are decoded.
    pub fn decode_as(mut self, decode_as: DecodeAs) -> Self {
        self.decode_as = decode_as;
        self
    }

    /// A codec that decodes every incoming message as a [`Frame`].
    pub fn frames(fallback: C) -> Self {
        Self::with_fallback(fallback).decode_as(DecodeAs::Frame)
    }

    /// A codec that decodes every incoming message with the fallback.
    pub fn typed(fallback: C) -> Self {
        Self::with_fallback(fallback).decode_as(DecodeAs::Typed)
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }
}

impl<C: Codec> Codec for RawCodec<C> {
    type Encode = Payload<C::Encode>;
    type Decode = Payload<C::Decode>;

    type Encoder = RawEncoder<C::Encoder>;
    type Decoder = RawDecoder<C::Decoder>;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder(self.fallback.encoder())
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder {
            fallback: self.fallback.decoder(),
            decode_as: self.decode_as,
        }
    }
}

pub struct RawEncoder<E>(E);

impl<E> Encoder for RawEncoder<E>
where
    E: Encoder<Error = Status>,
{
    type Item = Payload<E::Item>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            Payload::Frame(frame) => {
                frame.write_to(dst);
                Ok(())
            }
            Payload::Typed(value) => self.0.encode(value, dst),
        }
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.0.buffer_settings()
    }
}

pub struct RawDecoder<D> {
    fallback: D,
    decode_as: DecodeAs,
}

impl<D> Decoder for RawDecoder<D>
where
    D: Decoder<Error = Status>,
{
    type Item = Payload<D::Item>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode_as {
            DecodeAs::Frame => Ok(Some(Payload::Frame(Frame::from_buf(src)))),
            DecodeAs::Typed => Ok(self.fallback.decode(src)?.map(Payload::Typed)),
        }
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.fallback.buffer_settings()
    }
}

/// Extracts the content subtype (`proto` in `application/grpc+proto`) of a call.
///
/// Returns `None` for a plain `application/grpc` call or a non gRPC content type.
pub fn content_subtype(headers: &http::HeaderMap) -> Option<&str> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let subtype = content_type.strip_prefix(GRPC_CONTENT_TYPE)?.strip_prefix('+')?;
    // Parameters such as `; charset=utf-8` are not part of the subtype.
    let subtype = subtype.split(';').next()?.trim();
    (!subtype.is_empty()).then_some(subtype)
}

/// A `tower` service that requests a content subtype on every call it forwards.
///
/// A `tonic` client always sends `application/grpc`. Wrapping its channel in
/// `ContentSubtype::proxy(channel)` makes its calls opt in to the raw codec.
#[derive(Debug, Clone)]
pub struct ContentSubtype<S> {
    inner: S,
    content_type: HeaderValue,
}

impl<S> ContentSubtype<S> {
    pub fn new(inner: S, subtype: &str) -> Result<Self, InvalidHeaderValue> {
        let content_type = HeaderValue::from_str(&format!("{GRPC_CONTENT_TYPE}+{subtype}"))?;
        Ok(Self {
            inner,
            content_type,
        })
    }

    /// Requests the [`RawCodec::NAME`] subtype.
    pub fn proxy(inner: S) -> Self {
        Self {
            inner,
            content_type: HeaderValue::from_static("application/grpc+grpcproxy"),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, B> tower::Service<http::Request<B>> for ContentSubtype<S>
where
    S: tower::Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        request
            .headers_mut()
            .insert(CONTENT_TYPE, self.content_type.clone());
        self.inner.call(request)
    }
}
