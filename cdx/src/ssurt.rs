//! SSURT ("scheme-sorted URT") canonicalization of URLs.
//!
//! An SSURT key reorders a URL so that byte-wise ordering of keys follows
//! domain, host and path locality:
//!
//! ```text
//! https://user:pw@www.Example.com:8443/a/b?z=1&a=2#top
//!
//! com,example,www,//   8443:https@user:pw:   /a/b?a=2&z=1#top
//! \______________/     \________________/    \______________/
//!       host                 scheme                path
//! ```
//!
//! The host labels are reversed and each is followed by a comma, so a key
//! truncated before `//` is a prefix of every subdomain of that host. IP
//! literals are written as-is. Query parameters are sorted so equivalent URLs
//! produce the same key.
//!
//! Encoding is one-way: the original URL is kept alongside a key wherever it
//! is needed again.

use std::fmt;

use thiserror::Error;
use url::{Host, Url};

/// Reasons a URL cannot be canonicalized.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SsurtError {
    /// The URL was empty or only whitespace.
    #[error("URL is empty")]
    Empty,
    /// The URL could not be parsed.
    #[error("cannot parse URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    /// The URL parsed but has no host to key on (`mailto:`, `data:` and the like).
    #[error("URL {0:?} has no host")]
    MissingHost(String),
}

/// A URL split into the three SSURT parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SsurtKey {
    host: String,
    scheme: String,
    path: String,
}

/// Parse a URL leniently, assuming `http` when no scheme is given.
pub fn normalize(url: &str) -> Result<Url, SsurtError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(SsurtError::Empty);
    }

    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{}", trimmed))
    };
    parsed.map_err(|source| SsurtError::InvalidUrl {
        url: trimmed.to_owned(),
        source,
    })
}

/// Canonicalize a URL into its SSURT string.
pub fn encode(url: &str) -> Result<String, SsurtError> {
    SsurtKey::encode(url).map(|key| key.to_string())
}

impl SsurtKey {
    /// Normalize and canonicalize a URL.
    pub fn encode(url: &str) -> Result<SsurtKey, SsurtError> {
        Self::from_url(&normalize(url)?)
    }

    /// Canonicalize an already-parsed URL.
    pub fn from_url(url: &Url) -> Result<SsurtKey, SsurtError> {
        let mut host = match url.host() {
            Some(Host::Domain(domain)) => {
                let mut reversed = String::with_capacity(domain.len() + 3);
                for label in domain.split('.').rev().filter(|l| !l.is_empty()) {
                    reversed.push_str(label);
                    reversed.push(',');
                }
                reversed
            }
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => format!("[{}]", addr),
            None => return Err(SsurtError::MissingHost(url.as_str().to_owned())),
        };
        host.push_str("//");

        let mut scheme = String::new();
        if let Some(port) = url.port_or_known_default() {
            scheme.push_str(&port.to_string());
        }
        scheme.push(':');
        scheme.push_str(url.scheme());
        if !url.username().is_empty() {
            scheme.push('@');
            scheme.push_str(url.username());
            if let Some(password) = url.password() {
                scheme.push(':');
                scheme.push_str(password);
            }
        }
        scheme.push(':');

        let mut path = url.path().to_owned();
        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            let mut params: Vec<&str> = query.split('&').collect();
            params.sort_unstable();
            path.push('?');
            path.push_str(&params.join("&"));
        }
        if let Some(fragment) = url.fragment().filter(|f| !f.is_empty()) {
            path.push('#');
            path.push_str(fragment);
        }

        Ok(SsurtKey { host, scheme, path })
    }

    /// Reversed host labels, including the trailing `//`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, scheme and user information, e.g. `443:https:` or `80:http@user:`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Path, sorted query and fragment.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The key without its scheme part, which is what capture keys are sorted by.
    pub fn search_key(&self) -> String {
        let mut key = String::with_capacity(self.host.len() + self.path.len());
        key.push_str(&self.host);
        key.push_str(&self.path);
        key
    }
}

impl fmt::Display for SsurtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.host, self.scheme, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reverses_host_labels() {
        let key = SsurtKey::encode("http://www.Example.com/").unwrap();
        assert_eq!(key.host(), "com,example,www,//");
        assert_eq!(key.scheme(), "80:http:");
        assert_eq!(key.path(), "/");
        assert_eq!(key.to_string(), "com,example,www,//80:http:/");
        assert_eq!(key.search_key(), "com,example,www,///");
    }

    #[test]
    fn includes_port_and_userinfo() {
        assert_eq!(
            encode("https://user:pw@example.com:8443/a/b#top").unwrap(),
            "com,example,//8443:https@user:pw:/a/b#top"
        );
        assert_eq!(
            encode("http://anon@example.com/").unwrap(),
            "com,example,//80:http@anon:/"
        );
    }

    #[test]
    fn sorts_query_parameters() {
        let a = encode("http://example.com/p?b=2&a=1&c").unwrap();
        let b = encode("http://example.com/p?c&a=1&b=2").unwrap();
        assert_eq!(a, "com,example,//80:http:/p?a=1&b=2&c");
        assert_eq!(a, b);
    }

    #[test]
    fn ip_literals_are_not_reversed() {
        assert_eq!(
            encode("http://127.0.0.1:8080/x").unwrap(),
            "127.0.0.1//8080:http:/x"
        );
        assert_eq!(encode("http://[::1]/").unwrap(), "[::1]//80:http:/");
    }

    #[test]
    fn assumes_http_without_scheme() {
        assert_eq!(
            encode("example.com/a").unwrap(),
            encode("http://example.com/a").unwrap()
        );
    }

    #[test]
    fn encoding_is_stable() {
        let url = "https://b.example.org/x?z=9&y=8&x=7#f";
        let first = encode(url).unwrap();
        for _ in 0..16 {
            assert_eq!(encode(url).unwrap(), first);
        }
    }

    #[test]
    fn rejects_malformed_urls() {
        assert_eq!(encode("   "), Err(SsurtError::Empty));
        assert!(matches!(
            encode("http://"),
            Err(SsurtError::InvalidUrl { .. })
        ));
        assert!(matches!(
            encode("http://exa mple.com/"),
            Err(SsurtError::InvalidUrl { .. })
        ));
    }
}
