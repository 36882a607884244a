//! Connection authentication.
//!
//! Clients put `user` and `secret` in the websocket URL query string. An
//! [`Authenticator`] turns them into an [`Identity`] or refuses the
//! connection.

use std::collections::HashMap;

use serde::Deserialize;

use super::session::Identity;
use crate::core::{QUERY_SECRET, QUERY_USER};

/// Checks the credentials a client put in its connection URL.
pub trait Authenticator: Send + Sync + 'static {
    /// The identity for `user`/`secret`, or `None` to refuse the connection.
    fn authenticate(&self, user: &str, secret: &str) -> Option<Identity>;
}

#[derive(Debug, Clone, Deserialize)]
struct StaticUser {
    secret: String,
    #[serde(default)]
    privileged: bool,
}

/// A fixed table of users, e.g. loaded from a config file.
///
/// Deserializes from `{"alice": {"secret": "...", "privileged": true}}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticCredentials {
    users: HashMap<String, StaticUser>,
}

impl StaticCredentials {
    /// Empty table; every connection is refused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular user.
    pub fn user(self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.with(name.into(), secret.into(), false)
    }

    /// Add a privileged user.
    pub fn admin(self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.with(name.into(), secret.into(), true)
    }

    fn with(mut self, name: String, secret: String, privileged: bool) -> Self {
        self.users.insert(name, StaticUser { secret, privileged });
        self
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, user: &str, secret: &str) -> Option<Identity> {
        let entry = self.users.get(user)?;
        (entry.secret == secret).then(|| Identity {
            user: user.to_string(),
            privileged: entry.privileged,
        })
    }
}

/// `(user, secret)` from a URL query string, empty when absent.
pub(crate) fn credentials(query: &str) -> (String, String) {
    let mut user = String::new();
    let mut secret = String::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            QUERY_USER => user = value.into_owned(),
            QUERY_SECRET => secret = value.into_owned(),
            _ => {}
        }
    }
    (user, secret)
}
