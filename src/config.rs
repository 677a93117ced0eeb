use std::env;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::address::DomainSet;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("LOCAL_DOMAINS is not set or empty")]
    MissingDomains,

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Runtime settings of the filter. Read once at startup, then shared.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub domains: DomainSet,
    /// Envelope sender for forwards whose local mailbox cannot be told.
    pub fallback_sender: String,
    pub admin_address: String,
    pub notify_sender: String,
    pub subject_prefix: String,
    /// Also send the rewritten copy to local recipients.
    pub debug: bool,
    pub listen_addr: String,
    pub reinject: Endpoint,
    pub admin_relay: Endpoint,
    pub helo_name: String,
    pub smtp_timeout: Duration,
}

impl FilterConfig {
    /// Defaults for the given local domains. Fails when `domains` is empty.
    pub fn new(domains: DomainSet) -> Result<Self, ConfigError> {
        let primary = domains.primary().ok_or(ConfigError::MissingDomains)?.to_string();
        let reinject = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 10026,
        };
        Ok(Self {
            fallback_sender: format!("forwarder@{primary}"),
            admin_address: format!("admin@{primary}"),
            notify_sender: format!("mailfilter@{primary}"),
            subject_prefix: "Fwd: ".to_string(),
            debug: false,
            listen_addr: "127.0.0.1:10025".to_string(),
            admin_relay: reinject.clone(),
            reinject,
            helo_name: "localhost".to_string(),
            smtp_timeout: Duration::from_secs(60),
            domains,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from a variable lookup, logging every default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let domains = DomainSet::parse(&lookup("LOCAL_DOMAINS").unwrap_or_default());
        let mut config = Self::new(domains)?;

        let text = |name: &str, target: &mut String| match lookup(name) {
            Some(value) if !value.trim().is_empty() => *target = value,
            _ => debug!("[config] {} not set, defaulting to {:?}", name, target),
        };
        text("FALLBACK_SENDER", &mut config.fallback_sender);
        text("ADMIN_ADDRESS", &mut config.admin_address);
        text("NOTIFY_SENDER", &mut config.notify_sender);
        text("LISTEN_ADDR", &mut config.listen_addr);
        text("HELO_NAME", &mut config.helo_name);
        text("REINJECT_HOST", &mut config.reinject.host);

        // an explicitly empty prefix is allowed
        match lookup("SUBJECT_PREFIX") {
            Some(prefix) => config.subject_prefix = prefix,
            None => debug!(
                "[config] SUBJECT_PREFIX not set, defaulting to {:?}",
                config.subject_prefix
            ),
        }

        if let Some(port) = parse_var(&lookup, "REINJECT_PORT")? {
            config.reinject.port = port;
        }
        config.admin_relay = config.reinject.clone();
        text("ADMIN_HOST", &mut config.admin_relay.host);
        if let Some(port) = parse_var(&lookup, "ADMIN_PORT")? {
            config.admin_relay.port = port;
        }
        if let Some(secs) = parse_var::<_, u64>(&lookup, "SMTP_TIMEOUT_SECS")? {
            config.smtp_timeout = Duration::from_secs(secs);
        }

        if let Some(value) = lookup("FORWARD_DEBUG") {
            config.debug = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "" | "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "FORWARD_DEBUG",
                        value,
                    })
                }
            };
        }

        info!(
            "[config] domains={}, reinject={}, admin relay={}, admin={}, debug={}",
            config.domains.iter().collect::<Vec<_>>().join(","),
            config.reinject,
            config.admin_relay,
            config.admin_address,
            config.debug
        );
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => {
            debug!("[config] {} not set, using default", name);
            Ok(None)
        }
    }
}
