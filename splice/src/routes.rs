//! # Routing Table
//!
//! The [`Director`] of the `splice` binary: a static table from method-name prefixes to
//! backends, plus a policy rejecting calls that carry one of a set of metadata keys.
use splice_core::{CallContext, Director, Route, RouteDecision};
use tonic::{
    Status,
    transport::{Channel, Endpoint},
};

#[derive(Debug, thiserror::Error)]
pub enum RoutesError {
    #[error("invalid backend URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("no backend configured: pass --backend or at least one --route")]
    NoBackend,
}

/// A backend of the table. Its channel connects on first use.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub prefix: String,
    pub url: String,
    channel: Channel,
}

impl Upstream {
    fn new(prefix: String, url: String) -> Result<Self, RoutesError> {
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|source| RoutesError::InvalidUrl {
                url: url.clone(),
                source,
            })?
            .connect_lazy();

        Ok(Self {
            prefix,
            url,
            channel,
        })
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    /// Sorted by descending prefix length, so the first match is the longest one.
    upstreams: Vec<Upstream>,
    reject_headers: Vec<String>,
}

impl RoutingTable {
    /// Builds the table. The default backend, if any, is a route with an empty prefix.
    pub fn new(
        default: Option<String>,
        routes: Vec<(String, String)>,
        reject_headers: Vec<String>,
    ) -> Result<Self, RoutesError> {
        let mut upstreams = routes
            .into_iter()
            .chain(default.map(|url| (String::new(), url)))
            .map(|(prefix, url)| Upstream::new(prefix, url))
            .collect::<Result<Vec<_>, _>>()?;

        if upstreams.is_empty() {
            return Err(RoutesError::NoBackend);
        }
        // Stable: among equal prefixes the one given first wins.
        upstreams.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self {
            upstreams,
            reject_headers,
        })
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// The upstream of a full method name (`/package.Service/Method`).
    pub fn lookup(&self, full_method: &str) -> Option<&Upstream> {
        let method = full_method.strip_prefix('/').unwrap_or(full_method);
        self.upstreams
            .iter()
            .find(|upstream| method.starts_with(&upstream.prefix))
    }

    fn rejects(&self, ctx: &CallContext) -> Option<&str> {
        self.reject_headers
            .iter()
            .find(|key| ctx.metadata().contains_key(key.as_str()))
            .map(String::as_str)
    }
}

impl Director for RoutingTable {
    type Backend = Channel;

    async fn route(&self, ctx: &CallContext, full_method: &str) -> RouteDecision<Channel> {
        if let Some(key) = self.rejects(ctx) {
            tracing::debug!(method = full_method, key, "call rejected by header policy");
            return Err(Status::permission_denied(format!(
                "calls carrying '{key}' are rejected"
            )));
        }

        match self.lookup(full_method) {
            Some(upstream) => {
                tracing::trace!(method = full_method, backend = %upstream.url, "routing call");
                Ok(Route::new(ctx.outgoing(), upstream.channel.clone()))
            }
            None => Err(Status::unimplemented(format!(
                "no backend serves {full_method}"
            ))),
        }
    }
}
