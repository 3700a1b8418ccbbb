//! Local-origin guard for the API.
//!
//! The server starts agent jobs and writes to the working tree, so only pages
//! it serves itself (or origins named with `--allow-origin`) may call it. A
//! request is refused when its `Origin` is not allowed, or when its `Host` is
//! not one of the allowed hosts (DNS rebinding).

use std::collections::BTreeSet;

use anyhow::{Result, bail};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::{HOST, ORIGIN};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "[::1]"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    origins: BTreeSet<String>,
    hosts: BTreeSet<String>,
}

impl OriginPolicy {
    /// Loopback origins on `port`, plus `extra` origins such as
    /// `http://192.168.1.5:3001` for a server bound to a LAN address.
    pub fn local(port: u16, extra: &[String]) -> Result<Self> {
        let mut origins = BTreeSet::new();
        let mut hosts = BTreeSet::new();
        for host in LOOPBACK_HOSTS {
            hosts.insert(format!("{host}:{port}"));
            origins.insert(format!("http://{host}:{port}"));
        }
        for origin in extra {
            let origin = origin.trim_end_matches('/');
            let Some((scheme, authority)) = origin.split_once("://") else {
                bail!("allowed origin {origin:?} must look like http://host[:port]");
            };
            if !matches!(scheme, "http" | "https") || authority.is_empty() || authority.contains('/')
            {
                bail!("allowed origin {origin:?} must look like http://host[:port]");
            }
            hosts.insert(authority.to_ascii_lowercase());
            origins.insert(origin.to_ascii_lowercase());
        }
        Ok(Self { origins, hosts })
    }

    /// `authority` is the request URI's authority, used when there is no `Host` header.
    pub fn check(&self, headers: &HeaderMap, authority: Option<&str>) -> Result<(), ApiError> {
        let host = match headers.get(HOST) {
            Some(value) => value.to_str().ok(),
            None => authority,
        };
        let Some(host) = host else {
            return Err(ApiError::forbidden("missing Host header"));
        };
        if !self.hosts.contains(&host.to_ascii_lowercase()) {
            return Err(ApiError::forbidden(format!("host {host:?} is not allowed")));
        }

        if let Some(origin) = headers.get(ORIGIN) {
            let origin = origin.to_str().unwrap_or_default().to_ascii_lowercase();
            if !self.origins.contains(&origin) {
                return Err(ApiError::forbidden(format!(
                    "cross-origin request from {origin:?} refused"
                )));
            }
        }
        Ok(())
    }
}

/// Middleware: refuse requests that fail [`OriginPolicy::check`].
pub async fn enforce_local_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authority = request.uri().authority().map(|a| a.as_str().to_string());
    match state.origins.check(request.headers(), authority.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            warn!(method = %request.method(), path = %request.uri().path(), "request refused by origin guard");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::http::StatusCode;

    fn headers(host: Option<&str>, origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(HOST, HeaderValue::from_str(host).expect("host"));
        }
        if let Some(origin) = origin {
            headers.insert(ORIGIN, HeaderValue::from_str(origin).expect("origin"));
        }
        headers
    }

    fn policy() -> OriginPolicy {
        OriginPolicy::local(3001, &["http://192.168.1.5:3001/".to_string()]).expect("policy")
    }

    #[test]
    fn same_origin_and_originless_requests_pass() {
        let policy = policy();
        assert!(
            policy
                .check(&headers(Some("127.0.0.1:3001"), Some("http://127.0.0.1:3001")), None)
                .is_ok()
        );
        assert!(policy.check(&headers(Some("localhost:3001"), None), None).is_ok());
        assert!(
            policy
                .check(&headers(Some("192.168.1.5:3001"), Some("http://192.168.1.5:3001")), None)
                .is_ok()
        );
        assert!(policy.check(&headers(None, None), Some("[::1]:3001")).is_ok());
    }

    #[test]
    fn foreign_origins_are_refused() {
        let policy = policy();
        for origin in ["https://evil.example", "null", "http://localhost:8080"] {
            let err = policy
                .check(&headers(Some("127.0.0.1:3001"), Some(origin)), None)
                .unwrap_err();
            assert_eq!(err.status(), StatusCode::FORBIDDEN, "{origin}");
            assert_eq!(err.code(), "forbidden");
        }
    }

    #[test]
    fn rebound_host_names_are_refused() {
        let policy = policy();
        let err = policy
            .check(&headers(Some("attacker.example:3001"), None), None)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(policy.check(&headers(None, None), None).is_err());
    }

    #[test]
    fn malformed_extra_origins_are_rejected() {
        assert!(OriginPolicy::local(3001, &["192.168.1.5:3001".to_string()]).is_err());
        assert!(OriginPolicy::local(3001, &["ftp://host".to_string()]).is_err());
        assert!(OriginPolicy::local(3001, &["http://host/path".to_string()]).is_err());
    }
}
