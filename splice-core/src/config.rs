//! # Proxy Configuration
//!
//! The settings a [`crate::ProxyServer`] is built with. They are scoped to that server:
//! two servers in the same process can negotiate different content subtypes or
//! message size limits.
use crate::codec::RawCodec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Content subtype by which callers opt in to proxying (`application/grpc+<subtype>`).
    pub content_subtype: String,
    /// Limit on the size of a frame read from either leg. `None` keeps `tonic`'s default.
    pub max_decoding_message_size: Option<usize>,
    /// Limit on the size of a frame written to either leg. `None` keeps `tonic`'s default.
    pub max_encoding_message_size: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            content_subtype: RawCodec::<()>::NAME.to_string(),
            max_decoding_message_size: None,
            max_encoding_message_size: None,
        }
    }
}

impl ProxyConfig {
    pub fn with_content_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.content_subtype = subtype.into();
        self
    }

    pub fn with_max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = Some(limit);
        self
    }

    pub fn with_max_encoding_message_size(mut self, limit: usize) -> Self {
        self.max_encoding_message_size = Some(limit);
        self
    }
}
