//! # CLI
//!
//! This module defines the command-line interface of `splice` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring routes are
//! `prefix=url` and registered methods are `package.Service/Method`).
use clap::Parser;
use splice_core::{ProxyConfig, RawCodec};
use std::{net::SocketAddr, time::Duration};

#[derive(Parser, Debug)]
#[command(name = "splice", version, about = "Schema-oblivious gRPC reverse proxy")]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'a', long, default_value = "127.0.0.1:50050")]
    pub listen: SocketAddr,

    /// Backend receiving every call no route matches (e.g. http://localhost:50051)
    #[arg(short = 's', long)]
    pub backend: Option<String>,

    /// Route calls whose method starts with PREFIX to URL (e.g. ping.v1.=http://localhost:50051)
    ///
    /// The prefix is matched against `package.Service/Method`; the longest matching prefix wins.
    #[arg(long = "route", value_name = "PREFIX=URL", value_parser = parse_route)]
    pub routes: Vec<(String, String)>,

    /// Proxy this method explicitly (package.Service/Method)
    #[arg(long = "register", value_name = "SERVICE/METHOD", value_parser = parse_endpoint)]
    pub registrations: Vec<(String, String)>,

    /// Answer Unimplemented for every method not registered with --register
    #[arg(long)]
    pub no_catch_all: bool,

    /// Reject calls carrying this metadata key with PermissionDenied
    #[arg(long = "reject-header", value_name = "KEY")]
    pub reject_headers: Vec<String>,

    /// Stop serving after this many seconds
    #[arg(short = 't', long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Content subtype by which callers opt in to proxying
    #[arg(long, default_value = RawCodec::<()>::NAME)]
    pub content_subtype: String,

    /// Maximum size in bytes of a message read from either leg
    #[arg(long, value_name = "BYTES")]
    pub max_decoding_message_size: Option<usize>,

    /// Maximum size in bytes of a message written to either leg
    #[arg(long, value_name = "BYTES")]
    pub max_encoding_message_size: Option<usize>,
}

impl Cli {
    pub fn proxy_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::default().with_content_subtype(self.content_subtype.clone());
        if let Some(limit) = self.max_decoding_message_size {
            config = config.with_max_decoding_message_size(limit);
        }
        if let Some(limit) = self.max_encoding_message_size {
            config = config.with_max_encoding_message_size(limit);
        }
        config
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

fn parse_endpoint(value: &str) -> Result<(String, String), String> {
    let (service, method) = value.split_once('/').ok_or_else(|| {
        format!("Invalid endpoint format: '{value}'. Expected 'package.Service/Method'",)
    })?;

    if service.trim().is_empty() || method.trim().is_empty() {
        return Err("Service and Method names cannot be empty".to_string());
    }

    Ok((service.to_string(), method.to_string()))
}

fn parse_route(value: &str) -> Result<(String, String), String> {
    let (prefix, url) = value
        .split_once('=')
        .ok_or_else(|| format!("Invalid route format: '{value}'. Expected 'prefix=url'"))?;

    let url = url.trim();
    if url.is_empty() {
        return Err("Route URL cannot be empty".to_string());
    }

    Ok((prefix.trim().to_string(), url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_split() {
        assert_eq!(
            parse_endpoint("ping.v1.TestService/Ping"),
            Ok(("ping.v1.TestService".into(), "Ping".into()))
        );
        assert!(parse_endpoint("ping.v1.TestService").is_err());
        assert!(parse_endpoint(" /Ping").is_err());
    }

    #[test]
    fn routes_are_split() {
        assert_eq!(
            parse_route("ping.v1.=http://localhost:50051"),
            Ok(("ping.v1.".into(), "http://localhost:50051".into()))
        );
        assert_eq!(
            parse_route("=http://localhost:50051"),
            Ok(("".into(), "http://localhost:50051".into()))
        );
        assert!(parse_route("ping.v1.").is_err());
        assert!(parse_route("ping.v1.=").is_err());
    }

    #[test]
    fn flags_build_the_proxy_config() {
        let cli = Cli::try_parse_from([
            "splice",
            "--listen",
            "0.0.0.0:9000",
            "--backend",
            "http://localhost:50051",
            "--route",
            "ping.v1.=http://localhost:50052",
            "--register",
            "ping.v1.TestService/Ping",
            "--no-catch-all",
            "--reject-header",
            "x-deny",
            "--timeout",
            "60",
            "--max-decoding-message-size",
            "1024",
        ])
        .unwrap();

        assert_eq!(cli.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(cli.routes.len(), 1);
        assert_eq!(cli.registrations[0].1, "Ping");
        assert!(cli.no_catch_all);
        assert_eq!(cli.timeout(), Some(Duration::from_secs(60)));

        let config = cli.proxy_config();
        assert_eq!(config.content_subtype, "grpcproxy");
        assert_eq!(config.max_decoding_message_size, Some(1024));
        assert_eq!(config.max_encoding_message_size, None);
    }
}
