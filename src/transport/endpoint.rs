//! Endpoint expansion.
//!
//! A client is configured with either a literal host or a controller
//! identifier. A literal host yields one candidate URL. A controller
//! identifier yields two that are raced: the controller's address on the
//! local network and its address behind the remote relay.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::{
    ConnectionError, DEFAULT_LOCAL_DOMAIN, DEFAULT_PORT, DEFAULT_RELAY_DOMAIN, DEFAULT_SYNC_PATH,
    QUERY_SECRET, QUERY_USER,
};

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// A host (`host:port`) or full `ws://` / `wss://` URL.
    Literal(String),
    /// A controller identifier expanded under the configured domains.
    Controller(String),
}

impl Endpoint {
    /// Classify a user-entered string.
    ///
    /// Anything that looks like a host or URL (contains `.`, `:` or `/`)
    /// is literal; a bare word is a controller identifier.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.contains(['.', ':', '/']) {
            Self::Literal(input.to_string())
        } else {
            Self::Controller(input.to_string())
        }
    }

    /// Candidate URLs to race, with credentials in the query string.
    pub fn candidate_urls(
        &self,
        credentials: &Credentials,
        domains: &EndpointDomains,
    ) -> Result<Vec<String>, ConnectionError> {
        let bases = match self {
            Self::Literal(host) => vec![literal_url(host)?],
            Self::Controller(id) => {
                if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return Err(ConnectionError::InvalidEndpoint(format!(
                        "invalid controller identifier: {id:?}"
                    )));
                }
                let id = id.to_ascii_lowercase();
                vec![
                    parse_url(&format!(
                        "ws://{id}.{}:{}{DEFAULT_SYNC_PATH}",
                        domains.local, domains.port
                    ))?,
                    parse_url(&format!("wss://{id}.{}{DEFAULT_SYNC_PATH}", domains.relay))?,
                ]
            }
        };

        Ok(bases
            .into_iter()
            .map(|mut url| {
                url.query_pairs_mut()
                    .append_pair(QUERY_USER, &credentials.user)
                    .append_pair(QUERY_SECRET, &credentials.secret);
                url.to_string()
            })
            .collect())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(host) => f.write_str(host),
            Self::Controller(id) => write!(f, "controller {id}"),
        }
    }
}

fn literal_url(host: &str) -> Result<Url, ConnectionError> {
    let mut url = if host.contains("://") {
        parse_url(host)?
    } else {
        parse_url(&format!("ws://{host}"))?
    };
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectionError::InvalidEndpoint(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_SYNC_PATH);
    }
    Ok(url)
}

fn parse_url(text: &str) -> Result<Url, ConnectionError> {
    Url::parse(text).map_err(|e| ConnectionError::InvalidEndpoint(format!("{text}: {e}")))
}

/// Identity presented to the server.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub user: String,
    /// Shared secret.
    pub secret: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Domains a controller identifier expands under.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EndpointDomains {
    /// Local-network domain.
    pub local: String,
    /// Relay domain.
    pub relay: String,
    /// Controller port on the local network.
    pub port: u16,
}

impl Default for EndpointDomains {
    fn default() -> Self {
        Self {
            local: DEFAULT_LOCAL_DOMAIN.to_string(),
            relay: DEFAULT_RELAY_DOMAIN.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("alice", "s3cret&more")
    }

    #[test]
    fn test_parse_classifies_input() {
        assert_eq!(Endpoint::parse("hub-42"), Endpoint::Controller("hub-42".into()));
        assert_eq!(Endpoint::parse("192.168.1.20:8480"), Endpoint::Literal("192.168.1.20:8480".into()));
        assert_eq!(Endpoint::parse("ws://hub/sync"), Endpoint::Literal("ws://hub/sync".into()));
    }

    #[test]
    fn test_literal_host_gets_default_path() {
        let urls = Endpoint::Literal("127.0.0.1:9000".into())
            .candidate_urls(&creds(), &EndpointDomains::default())
            .unwrap();
        assert_eq!(urls, vec!["ws://127.0.0.1:9000/sync?user=alice&secret=s3cret%26more".to_string()]);
    }

    #[test]
    fn test_literal_url_keeps_path() {
        let urls = Endpoint::Literal("wss://example.com/custom".into())
            .candidate_urls(&creds(), &EndpointDomains::default())
            .unwrap();
        assert!(urls[0].starts_with("wss://example.com/custom?user=alice"));
    }

    #[test]
    fn test_literal_rejects_other_schemes() {
        let err = Endpoint::Literal("http://example.com".into())
            .candidate_urls(&creds(), &EndpointDomains::default())
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_controller_expands_to_two_candidates() {
        let urls = Endpoint::Controller("Hub42".into())
            .candidate_urls(&creds(), &EndpointDomains::default())
            .unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].starts_with("ws://hub42.local:8480/sync?"));
        assert!(urls[1].starts_with("wss://hub42.relay.lumen-hub.net/sync?"));
        assert!(urls.iter().all(|u| u.contains("user=alice")));
    }

    #[test]
    fn test_controller_rejects_bad_identifier() {
        let err = Endpoint::Controller("bad id".into())
            .candidate_urls(&creds(), &EndpointDomains::default())
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let text = format!("{:?}", creds());
        assert!(text.contains("alice"));
        assert!(!text.contains("s3cret"));
    }
}
