//! Broker configuration from environment variables.

use std::env;
use std::fmt;

use karabo_data::{KaraboError, Result};

pub const DEFAULT_BROKER: &str = "tcp://localhost:7777";

/// Transport named by a broker URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Amqp,
}

impl fmt::Display for BrokerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BrokerScheme::Tcp => "tcp",
            BrokerScheme::Amqp => "amqp",
        })
    }
}

/// Where and under which topic instances meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker URLs, tried in order.
    pub urls: Vec<String>,

    /// Topic isolating one installation from others on the same broker.
    pub topic: String,

    /// Optional topology domain.
    pub domain: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            urls: vec![DEFAULT_BROKER.to_string()],
            topic: default_topic(),
            domain: None,
        }
    }
}

fn default_topic() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "karabo".to_string())
}

impl BrokerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KARABO_BROKER`: comma-separated broker URLs (default: tcp://localhost:7777)
    /// - `KARABO_BROKER_TOPIC`: topic (default: the OS user name)
    /// - `KARABO_DOMAIN`: topology domain (default: none)
    pub fn from_env() -> Self {
        Self {
            urls: env::var("KARABO_BROKER")
                .map(|v| parse_urls(&v))
                .ok()
                .filter(|urls| !urls.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_BROKER.to_string()]),

            topic: env::var("KARABO_BROKER_TOPIC")
                .ok()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(default_topic),

            domain: env::var("KARABO_DOMAIN").ok().filter(|d| !d.is_empty()),
        }
    }

    /// The scheme shared by all URLs.
    pub fn scheme(&self) -> Result<BrokerScheme> {
        let mut schemes = self.urls.iter().map(|u| scheme_of(u));
        let first = schemes
            .next()
            .ok_or_else(|| KaraboError::Broker("no broker URL configured".into()))??;
        for scheme in schemes {
            if scheme? != first {
                return Err(KaraboError::Broker(format!(
                    "mixed broker schemes in '{}'",
                    self.urls.join(",")
                )));
            }
        }
        Ok(first)
    }

    /// `host:port` of every URL (scheme stripped).
    pub fn addresses(&self) -> Vec<String> {
        self.urls
            .iter()
            .map(|u| {
                let rest = u.split_once("://").map_or(u.as_str(), |(_, r)| r);
                rest.trim_end_matches('/').to_string()
            })
            .collect()
    }
}

fn parse_urls(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

fn scheme_of(url: &str) -> Result<BrokerScheme> {
    match url.split_once("://").map(|(s, _)| s.to_ascii_lowercase()) {
        Some(s) if s == "tcp" => Ok(BrokerScheme::Tcp),
        Some(s) if s == "amqp" => Ok(BrokerScheme::Amqp),
        _ => Err(KaraboError::Broker(format!("unsupported broker URL '{url}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(urls: &str) -> BrokerConfig {
        BrokerConfig {
            urls: parse_urls(urls),
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_scheme_detection() {
        assert_eq!(config("tcp://a:1, tcp://b:2").scheme().unwrap(), BrokerScheme::Tcp);
        assert_eq!(config("amqp://guest@h:5672").scheme().unwrap(), BrokerScheme::Amqp);
        assert_eq!(config("tcp://a:1,tcp://b:2/").addresses(), vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_mixed_or_unknown_schemes_rejected() {
        assert!(matches!(
            config("tcp://a:1,amqp://b:2").scheme(),
            Err(KaraboError::Broker(_))
        ));
        assert!(config("mqtt://a:1").scheme().is_err());
        assert!(config("").scheme().is_err());
    }
}
