//! Deriving iteration prefixes from SSURT keys.
//!
//! Capture keys are sorted by `host + path`, with the SSURT scheme part moved
//! behind the timestamp, so every match type except `verbatim` becomes a plain
//! prefix over those keys:
//!
//! | match      | prefix for `com,example,//80:http:/a/b?q` |
//! |------------|-------------------------------------------|
//! | `exact`    | `com,example,///a/b?q␠`                   |
//! | `verbatim` | as `exact`, scheme part must equal `80:http:` |
//! | `prefix`   | `com,example,///a/b`                      |
//! | `host`     | `com,example,//`                          |
//! | `domain`   | `com,example,`                            |

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// How much of a URL a search must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatchType {
    /// This URL, any scheme, port or user information.
    #[default]
    Exact,
    /// This URL including scheme, port and user information.
    Verbatim,
    /// This URL and everything below it, ignoring query and fragment.
    Prefix,
    /// Every URL on this exact host.
    Host,
    /// Every URL on this host and its subdomains.
    Domain,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown match type {0:?}")]
pub struct InvalidMatchType(pub String);

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Verbatim => "verbatim",
            MatchType::Prefix => "prefix",
            MatchType::Host => "host",
            MatchType::Domain => "domain",
        }
    }

    /// Whether keys in scope all share one URL, so appending a timestamp gives a seek point.
    pub fn is_exact(self) -> bool {
        matches!(self, MatchType::Exact | MatchType::Verbatim)
    }
}

impl FromStr for MatchType {
    type Err = InvalidMatchType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(MatchType::Exact),
            "verbatim" => Ok(MatchType::Verbatim),
            "prefix" => Ok(MatchType::Prefix),
            "host" => Ok(MatchType::Host),
            "domain" => Ok(MatchType::Domain),
            _ => Err(InvalidMatchType(s.to_owned())),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of the capture keyspace a search covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Every capture key in scope starts with these bytes.
    pub prefix: String,
    /// For exact matches, the key a timestamp can be appended to for seeking.
    pub seek: Option<String>,
    /// For verbatim matches, the scheme part a capture must carry.
    pub scheme: Option<String>,
}

impl Scope {
    /// Whether every capture key in `other` is also in this scope.
    pub fn covers(&self, other: &Scope) -> bool {
        other.prefix.starts_with(&self.prefix)
            && (self.scheme.is_none() || self.scheme == other.scheme)
    }
}

/// Split an SSURT string into host (through `//`), scheme and path parts.
///
/// Strings without `//` are all host; this is what a `domain` scope looks like.
pub fn split(key: &str) -> (&str, &str, &str) {
    let host_end = match key.find("//") {
        Some(i) => i + 2,
        None => return (key, "", ""),
    };
    let (host, rest) = key.split_at(host_end);
    let scheme_end = rest.find('/').unwrap_or(rest.len());
    let (scheme, path) = rest.split_at(scheme_end);
    (host, scheme, path)
}

/// Derive the iteration prefix (and seek key) for `key` under `match_type`.
///
/// An empty key scopes to everything.
pub fn scope(key: &str, match_type: MatchType) -> Scope {
    if key.is_empty() {
        return Scope {
            prefix: String::new(),
            seek: None,
            scheme: None,
        };
    }

    let (host, scheme, path) = split(key);
    let prefix = match match_type {
        MatchType::Exact | MatchType::Verbatim => {
            let mut exact = format!("{}{}", host, path);
            if !exact.ends_with(' ') {
                exact.push(' ');
            }
            exact
        }
        MatchType::Prefix => {
            let end = path.find(|c: char| c == '?' || c == '#').unwrap_or(path.len());
            format!("{}{}", host, &path[..end])
        }
        MatchType::Host => host.to_owned(),
        MatchType::Domain => host.strip_suffix("//").unwrap_or(host).to_owned(),
    };

    Scope {
        seek: match_type.is_exact().then(|| prefix.clone()),
        scheme: (match_type == MatchType::Verbatim).then(|| scheme.to_owned()),
        prefix,
    }
}
