use anyhow::{bail, Context};
use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::ice::{
    IceServer, IceServerProvider, StaticIceServers, TwilioIceServers, DEFAULT_STUN_URL,
    DEFAULT_TWILIO_BASE_URL,
};
use crate::identity::UuidIssuer;
use crate::router::MessageRouter;
use crate::websocket::{DEFAULT_OUTBOUND_BUFFER, MIN_OUTBOUND_BUFFER};

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay",
    author,
    version,
    about = "Beach WebRTC signaling relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// STUN urls handed to clients, and the fallback when TURN credentials cannot be fetched.
    #[arg(
        long = "stun-url",
        env = "BEACH_RELAY_STUN_URLS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_URL
    )]
    pub stun_urls: Vec<String>,

    /// Twilio account SID; together with the auth token enables per-client TURN credentials.
    #[arg(long, env = "TWILIO_ACCOUNT_SID")]
    pub twilio_account_sid: Option<String>,

    #[arg(long, env = "TWILIO_AUTH_TOKEN", hide_env_values = true)]
    pub twilio_auth_token: Option<String>,

    #[arg(long, env = "BEACH_RELAY_TWILIO_BASE_URL", default_value = DEFAULT_TWILIO_BASE_URL)]
    pub twilio_base_url: String,

    /// Lifetime requested for TURN credentials.
    #[arg(long, env = "BEACH_RELAY_ICE_TTL_SECS", default_value_t = 86_400)]
    pub ice_ttl_secs: u64,

    /// Upper bound on the ICE lookup before the fallback list is sent.
    #[arg(long, env = "BEACH_RELAY_ICE_TIMEOUT_SECS", default_value_t = 5)]
    pub ice_timeout_secs: u64,

    /// Per-connection outbound queue depth; envelopes beyond it are dropped.
    #[arg(long, env = "BEACH_RELAY_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, env = "BEACH_RELAY_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Clone)]
pub enum IceSource {
    Static,
    Twilio {
        base_url: String,
        account_sid: String,
        auth_token: String,
        ttl: Duration,
    },
}

impl fmt::Debug for IceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceSource::Static => f.write_str("Static"),
            IceSource::Twilio {
                base_url,
                account_sid,
                ttl,
                ..
            } => f
                .debug_struct("Twilio")
                .field("base_url", base_url)
                .field("account_sid", account_sid)
                .field("auth_token", &"<redacted>")
                .field("ttl", ttl)
                .finish(),
        }
    }
}

impl IceSource {
    pub fn label(&self) -> &'static str {
        match self {
            IceSource::Static => "static",
            IceSource::Twilio { .. } => "twilio",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub stun_urls: Vec<String>,
    pub ice: IceSource,
    pub ice_timeout: Duration,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let stun_urls: Vec<String> = cli
            .stun_urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();

        let ice = match (cli.twilio_account_sid, cli.twilio_auth_token) {
            (Some(account_sid), Some(auth_token)) => IceSource::Twilio {
                base_url: cli.twilio_base_url,
                account_sid,
                auth_token,
                ttl: Duration::from_secs(cli.ice_ttl_secs),
            },
            (None, None) => IceSource::Static,
            _ => bail!("twilio ice servers need both an account sid and an auth token"),
        };

        if cli.outbound_buffer < MIN_OUTBOUND_BUFFER {
            bail!(
                "outbound buffer must hold at least {MIN_OUTBOUND_BUFFER} envelopes, got {}",
                cli.outbound_buffer
            );
        }
        if cli.ice_timeout_secs == 0 {
            bail!("ice timeout must be greater than zero");
        }

        Ok(Config {
            listen_addr,
            stun_urls,
            ice,
            ice_timeout: Duration::from_secs(cli.ice_timeout_secs),
            outbound_buffer: cli.outbound_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

impl Config {
    pub fn stun_servers(&self) -> Vec<IceServer> {
        self.stun_urls.iter().map(IceServer::stun).collect()
    }

    pub fn ice_provider(&self) -> Arc<dyn IceServerProvider> {
        match &self.ice {
            IceSource::Static => Arc::new(StaticIceServers::new(self.stun_servers())),
            IceSource::Twilio {
                base_url,
                account_sid,
                auth_token,
                ttl,
            } => Arc::new(TwilioIceServers::new(
                base_url.clone(),
                account_sid.clone(),
                auth_token.clone(),
                *ttl,
            )),
        }
    }

    pub fn message_router(&self) -> MessageRouter {
        MessageRouter::new(Arc::new(UuidIssuer), self.ice_provider())
            .with_ice_fallback(self.stun_servers())
            .with_ice_timeout(self.ice_timeout)
    }
}
