//! Identity of one CouchDB server: where it lives and how to authenticate.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5984;

/// Basic-auth credential. Only the descriptor builders and replication
/// bodies ever see it; everything else works with the encoded token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    username: String,
    password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Host, port, scheme and optional credential of a CouchDB server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerIdentity {
    host: String,
    port: u16,
    secure: bool,
    credential: Option<Credential>,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            secure: false,
            credential: None,
        }
    }
}

impl ServerIdentity {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_credential(mut self, username: &str, password: &str) -> Self {
        self.set_credential(username, password);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Store a credential. An empty username or password leaves the
    /// identity unauthenticated.
    pub fn set_credential(&mut self, username: &str, password: &str) {
        if username.is_empty() || password.is_empty() {
            return;
        }
        self.credential = Some(Credential {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    pub fn clear_credential(&mut self) {
        self.credential = None;
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Base64 of `user:pass`, ready for an `Authorization: Basic` header.
    pub fn credential_token(&self) -> Option<String> {
        self.credential
            .as_ref()
            .map(|c| STANDARD.encode(format!("{}:{}", c.username, c.password)))
    }

    fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// `http[s]://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }

    /// Base URL with the credential embedded as userinfo. Used when another
    /// server has to reach this one, e.g. as a replication endpoint.
    pub fn base_url_with_credential(&self) -> String {
        match &self.credential {
            Some(c) => format!(
                "{}://{}:{}@{}:{}",
                self.scheme(),
                urlencoding::encode(&c.username),
                urlencoding::encode(&c.password),
                self.host,
                self.port
            ),
            None => self.base_url(),
        }
    }
}
