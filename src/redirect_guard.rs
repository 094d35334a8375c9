//! Validation of "return to" targets before the browser is sent there.

use std::fmt::Display;

use url::Url;

use crate::UnsafeRedirect;

/// A target that passed the guard. Only [`RedirectGuard`] constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeRedirect(String);

impl SafeRedirect {
    /// The site root, always safe.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for SafeRedirect {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedirectGuard {
    allowed_hosts: Vec<String>,
}

fn reject(target: &str, reason: &'static str) -> UnsafeRedirect {
    UnsafeRedirect {
        target: target.to_string(),
        reason,
    }
}

/// A query key or value that is itself somewhere to go.
fn looks_like_redirect(value: &str) -> bool {
    value.starts_with("//") || value.starts_with("/\\") || value.contains("://")
}

impl RedirectGuard {
    /// `allowed_hosts` entries are `host` (any port) or `host:port`.
    pub fn new<I, S>(allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|host| host.as_ref().trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
        }
    }

    pub fn sanitize(
        &self,
        candidate: &str,
        request_host: &str,
    ) -> Result<SafeRedirect, UnsafeRedirect> {
        if candidate.is_empty() {
            return Err(reject(candidate, "empty target"));
        }
        if candidate
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(reject(candidate, "control or whitespace character"));
        }
        if candidate.contains('\\') {
            return Err(reject(candidate, "backslash"));
        }
        let lowered = candidate.to_ascii_lowercase();
        if lowered.starts_with("/%2f") || lowered.starts_with("/%5c") {
            return Err(reject(candidate, "scheme-relative"));
        }
        if lowered.contains("%0a") || lowered.contains("%0d") || lowered.contains("%00") {
            return Err(reject(candidate, "encoded control character"));
        }

        let request_host = request_host.trim().to_ascii_lowercase();

        if candidate.starts_with('/') {
            if candidate.starts_with("//") {
                return Err(reject(candidate, "scheme-relative"));
            }
            let base = Url::parse(&format!("https://{request_host}/"))
                .map_err(|_| reject(candidate, "invalid request host"))?;
            let resolved = base
                .join(candidate)
                .map_err(|_| reject(candidate, "unparsable path"))?;
            if resolved.host_str() != base.host_str() || resolved.port() != base.port() {
                return Err(reject(candidate, "path escapes the origin"));
            }
            self.check_nested(candidate, &resolved)?;
            return Ok(SafeRedirect(candidate.to_string()));
        }

        let url = Url::parse(candidate)
            .map_err(|_| reject(candidate, "neither a rooted path nor an absolute URL"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(reject(candidate, "scheme not allowed"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(reject(candidate, "userinfo not allowed"));
        }
        let Some(host) = url.host_str() else {
            return Err(reject(candidate, "missing host"));
        };
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let allowed = authority == request_host
            || self
                .allowed_hosts
                .iter()
                .any(|allowed| *allowed == authority || allowed == host);
        if !allowed {
            return Err(reject(candidate, "foreign host"));
        }
        self.check_nested(candidate, &url)?;
        Ok(SafeRedirect(url.to_string()))
    }

    fn check_nested(&self, candidate: &str, url: &Url) -> Result<(), UnsafeRedirect> {
        let path = url.path().to_ascii_lowercase();
        if path.contains("://") || path.contains("%3a%2f%2f") || path.contains(":%2f%2f") {
            return Err(reject(candidate, "nested redirect in path"));
        }
        if url
            .query_pairs()
            .any(|(key, value)| looks_like_redirect(&key) || looks_like_redirect(&value))
        {
            return Err(reject(candidate, "nested redirect in query"));
        }
        Ok(())
    }
}
