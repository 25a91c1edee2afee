use crate::args::{Args, DEFAULT_STATE_FILE};
use crate::dump::DumpConfig;
use anyhow::{Context, Result};
use derive_builder::Builder;
use hyper::Uri;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Everything [`crate::run_server`] needs.
#[derive(Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct ProxyConfig {
    /// Address to listen on
    #[builder(default = "SocketAddr::from(([0, 0, 0, 0], 8080))")]
    pub bind_addr: SocketAddr,
    /// Persisted identities
    #[builder(setter(into), default = "PathBuf::from(DEFAULT_STATE_FILE)")]
    pub state_file: PathBuf,
    /// Real control server
    #[builder(setter(into))]
    pub upstream_url: String,
    #[builder(default)]
    pub dump: DumpConfig,
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    pub fn from_args(args: Args) -> Result<Self> {
        Self::builder()
            .bind_addr(args.bind_addr)
            .state_file(args.state_file)
            .upstream_url(args.upstream_url)
            .dump(DumpConfig {
                headers: args.dump_headers,
                bodies: args.dump_bodies,
                mappolls: args.dump_mappolls,
            })
            .build()
            .context("Invalid proxy configuration")
    }
}

impl ProxyConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let Some(url) = &self.upstream_url else {
            return Ok(());
        };
        let uri: Uri = url
            .parse()
            .map_err(|e| format!("invalid upstream URL {:?}: {}", url, e))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(format!("upstream URL {:?} needs a scheme and host", url));
        }
        Ok(())
    }
}
