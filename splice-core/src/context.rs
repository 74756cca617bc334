//! # Call Context
//!
//! Per-call metadata, cancellation signal and deadline, as seen by the [`crate::Director`]
//! and forwarded to the backend leg.
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

/// Header carrying the caller's timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Headers describing a single hop of the transport. They are regenerated for every
/// leg of a call and are never copied from one leg to the other.
const HOP_HEADERS: &[&str] = &[
    "te",
    "user-agent",
    "content-type",
    "content-length",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
];

/// The context of one proxied call.
#[derive(Debug, Clone)]
pub struct CallContext {
    metadata: MetadataMap,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    pub fn new(metadata: MetadataMap) -> Self {
        Self {
            metadata,
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Builds the context of an inbound call, deriving the deadline from its `grpc-timeout`
    /// header (an unparsable timeout is ignored).
    pub fn from_inbound(metadata: MetadataMap) -> Self {
        let deadline = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);

        Self::new(metadata).with_deadline(deadline)
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// The context for a backend call derived from this one.
    ///
    /// The metadata is copied without hop headers, the deadline is kept, and the
    /// cancellation token is a child of this context's token.
    pub fn outgoing(&self) -> Self {
        Self {
            metadata: forwardable_metadata(&self.metadata),
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn into_metadata(self) -> MetadataMap {
        self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Copies `metadata` without the headers that only describe one transport hop.
pub fn forwardable_metadata(metadata: &MetadataMap) -> MetadataMap {
    let mut headers = metadata.clone().into_headers();
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
    MetadataMap::from_headers(headers)
}

/// Parses a `grpc-timeout` header value: at most 8 ASCII digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u` or `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 || !value.is_ascii() {
        return None;
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };

    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("99999999n"), Some(Duration::from_nanos(99_999_999)));
    }

    #[test]
    fn malformed_grpc_timeouts_are_rejected() {
        for value in ["", "S", "10", "10s", "-1S", "123456789S", "1.5S", "١S"] {
            assert_eq!(parse_grpc_timeout(value), None, "{value:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_deadline_comes_from_grpc_timeout() {
        let mut metadata = MetadataMap::new();
        metadata.insert(GRPC_TIMEOUT_HEADER, MetadataValue::from_static("500m"));

        let ctx = CallContext::from_inbound(metadata);

        assert_eq!(ctx.timeout(), Some(Duration::from_millis(500)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ctx.timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn outgoing_context_drops_hop_headers() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-trace-id", MetadataValue::from_static("abc"));
        metadata.append("x-trace-id", MetadataValue::from_static("def"));
        metadata.insert("grpc-timeout", MetadataValue::from_static("1S"));
        metadata.insert("te", MetadataValue::from_static("trailers"));
        metadata.insert("content-type", MetadataValue::from_static("application/grpc"));
        metadata.insert_bin("x-token-bin", tonic::metadata::MetadataValue::from_bytes(b"\x00\x01"));

        let ctx = CallContext::new(metadata);
        let outgoing = ctx.outgoing();

        let traces: Vec<_> = outgoing
            .metadata()
            .get_all("x-trace-id")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(traces, ["abc", "def"]);
        assert!(outgoing.metadata().get_bin("x-token-bin").is_some());
        assert!(outgoing.metadata().get("grpc-timeout").is_none());
        assert!(outgoing.metadata().get("te").is_none());
        assert!(outgoing.metadata().get("content-type").is_none());
    }

    #[test]
    fn outgoing_cancellation_follows_the_inbound_call() {
        let ctx = CallContext::new(MetadataMap::new());
        let outgoing = ctx.outgoing();

        outgoing.cancellation().cancel();
        assert!(!ctx.is_cancelled(), "a backend leg never cancels its caller");

        let outgoing = ctx.outgoing();
        ctx.cancellation().cancel();
        assert!(outgoing.is_cancelled());
    }
}
