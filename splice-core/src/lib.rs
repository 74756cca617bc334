//! # Splice Core
//!
//! `splice-core` is the library powering the `splice` reverse proxy. It forwards gRPC calls
//! of any shape (unary, client, server or bidirectional streaming) to backends chosen at
//! runtime, without compile-time knowledge of their Protobuf schema.
//!
//! ## Key Components
//!
//! * **[`Director`]:** The routing decision. Given the [`CallContext`] and full method name of
//!   a call it answers with a [`Route`] to a backend or with a rejection status.
//! * **[`StreamProxy`]:** The handler splicing a caller to the chosen backend. Messages travel
//!   as opaque [`Frame`]s, headers and trailers are relayed, and cancellation and deadlines
//!   reach the backend leg.
//! * **[`ProxyServer`]:** The registrar wiring the handler into a `tonic` server, for explicit
//!   methods and as a catch-all, next to ordinary typed services.
//!
//! ## RawCodec
//!
//! An implementation of `tonic::codec::Codec` that moves [`Frame`]s as literal bytes and
//! delegates typed messages to a fallback codec (`tonic_prost::ProstCodec` by default).
//!
//! * **Encoder**: writes frames unchanged, encodes typed messages with the fallback.
//! * **Decoder**: yields frames or typed messages, as chosen with [`DecodeAs`].
//!
//! ## Re-exports
//!
//! This crate re-exports `prost` and `tonic` to ensure that consumers use compatible versions
//! of these underlying dependencies.
pub mod codec;
pub mod config;
pub mod context;
pub mod director;
pub mod proxy;
pub mod server;

pub use codec::{ContentSubtype, DecodeAs, Frame, FrameCodec, Payload, RawCodec};
pub use config::ProxyConfig;
pub use context::CallContext;
pub use director::{Backend, Director, Route, RouteDecision};
pub use proxy::{Phase, ProxyError, StreamProxy};
pub use server::{ProxyServer, ProxyServerBuilder, RegistrarError};

// Re-exports
pub use prost;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
