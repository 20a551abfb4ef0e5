use serde::{Deserialize, Serialize};

/// Connection settings for a WebDAV server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DavConfig {
    /// Base URL; every filesystem path is resolved below it.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for DavConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://localhost/"),
            username: None,
            password: None,
            timeout_secs: 30,
            max_redirects: 10,
            user_agent: format!("davfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
