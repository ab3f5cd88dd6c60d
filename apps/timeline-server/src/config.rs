use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use thiserror::Error;
use timeline_core::ProjectId;

use crate::{auth::AuthConfig, session::SessionConfig};

#[derive(Debug, Parser)]
#[command(
    name = "timeline-server",
    author,
    version,
    about = "Live sync server for collaborative project timelines"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TIMELINE_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Redis connection URI. Events and memberships are kept in memory when unset.
    #[arg(long, env = "TIMELINE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// HS256 secret used to verify bearer credentials.
    #[arg(long, env = "TIMELINE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Expected `iss` claim.
    #[arg(long, env = "TIMELINE_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    /// Accept credentials without checking their signature (development only).
    #[arg(long, env = "TIMELINE_AUTH_BYPASS", default_value_t = false)]
    pub auth_bypass: bool,

    /// In-memory membership grants as `PROJECT:SUBJECT`.
    #[arg(long = "grant", env = "TIMELINE_GRANTS", value_delimiter = ',')]
    pub grants: Vec<String>,

    /// Treat every authenticated identity as a member of every project.
    #[arg(long, env = "TIMELINE_OPEN_MEMBERSHIP", default_value_t = false)]
    pub open_membership: bool,

    #[arg(long, env = "TIMELINE_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "TIMELINE_RECYCLE_INTERVAL_SECS", default_value_t = 30)]
    pub recycle_interval_secs: u64,

    #[arg(long, env = "TIMELINE_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Outbound queue depth per connection. A connection whose queue fills up is dropped.
    #[arg(long, env = "TIMELINE_CONNECTION_BUFFER", default_value_t = 256)]
    pub connection_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIMELINE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub auth: AuthConfig,
    pub membership: MembershipConfig,
    pub session: SessionConfig,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct MembershipConfig {
    pub grants: Vec<Grant>,
    pub open: bool,
}

/// A seeded `(project, subject)` membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grant {
    pub project: ProjectId,
    pub subject: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrantParseError {
    #[error("grant {0:?} must look like PROJECT:SUBJECT")]
    Shape(String),
    #[error("grant {0:?} has a non-numeric project id")]
    Project(String),
}

impl FromStr for Grant {
    type Err = GrantParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (project, subject) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| GrantParseError::Shape(raw.to_string()))?;
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(GrantParseError::Shape(raw.to_string()));
        }
        let project = project
            .parse()
            .map_err(|_| GrantParseError::Project(raw.to_string()))?;
        Ok(Grant {
            project,
            subject: subject.to_string(),
        })
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let jwt_secret = cli.jwt_secret.filter(|secret| !secret.is_empty());
        if jwt_secret.is_none() && !cli.auth_bypass {
            bail!("TIMELINE_JWT_SECRET is required unless TIMELINE_AUTH_BYPASS is set");
        }
        if cli.connection_buffer == 0 {
            bail!("connection buffer must be at least 1");
        }
        if cli.idle_timeout_secs == 0 || cli.recycle_interval_secs == 0 || cli.ping_interval_secs == 0
        {
            bail!("idle timeout, recycle interval and ping interval must be non-zero");
        }

        let grants = cli
            .grants
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| raw.parse::<Grant>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url.filter(|url| !url.is_empty()),
            auth: AuthConfig {
                secret: jwt_secret,
                issuer: cli.jwt_issuer,
                bypass: cli.auth_bypass,
            },
            membership: MembershipConfig {
                grants,
                open: cli.open_membership,
            },
            session: SessionConfig {
                per_connection_buffer: cli.connection_buffer,
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                recycle_interval: Duration::from_secs(cli.recycle_interval_secs),
                ping_interval: Duration::from_secs(cli.ping_interval_secs),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["timeline-server"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn defaults_apply_with_secret() {
        let config = parse(&["--jwt-secret", "s3cret"]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(config.redis_url.is_none());
        assert_eq!(config.session.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.session.per_connection_buffer, 256);
        assert!(!config.membership.open);
    }

    #[test_timeout::timeout]
    fn secret_required_without_bypass() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--auth-bypass"]).is_ok());
    }

    #[test_timeout::timeout]
    fn grants_split_on_commas() {
        let config = parse(&["--auth-bypass", "--grant", "42:alice,42:bob", "--grant", "7:carol"])
            .unwrap();
        assert_eq!(config.membership.grants.len(), 3);
        assert_eq!(
            config.membership.grants[2],
            Grant {
                project: ProjectId(7),
                subject: "carol".into()
            }
        );
    }

    #[test_timeout::timeout]
    fn malformed_grants_are_rejected() {
        assert_eq!(
            "alice".parse::<Grant>(),
            Err(GrantParseError::Shape("alice".into()))
        );
        assert_eq!(
            "x:alice".parse::<Grant>(),
            Err(GrantParseError::Project("x:alice".into()))
        );
        assert!(parse(&["--auth-bypass", "--grant", "42:"]).is_err());
    }

    #[test_timeout::timeout]
    fn zero_buffer_is_rejected() {
        assert!(parse(&["--auth-bypass", "--connection-buffer", "0"]).is_err());
    }
}
