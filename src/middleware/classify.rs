//! Deciding whether a request comes from an authenticated user.

use axum::extract::Request;
use axum::http::header::COOKIE;

use crate::error::{Result, ShedderError};
use crate::protocol::RequestKind;

/// Classifies requests as authenticated (`User`) or anonymous (`Anon`).
pub trait RequestClassifier: Send + Sync {
    fn classify(&self, request: &Request) -> Result<RequestKind>;
}

impl<F> RequestClassifier for F
where
    F: Fn(&Request) -> Result<RequestKind> + Send + Sync,
{
    fn classify(&self, request: &Request) -> Result<RequestKind> {
        self(request)
    }
}

/// Treats a request as authenticated when it carries a non-empty auth cookie.
#[derive(Debug, Clone)]
pub struct CookieClassifier {
    name: String,
}

impl CookieClassifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl RequestClassifier for CookieClassifier {
    fn classify(&self, request: &Request) -> Result<RequestKind> {
        for header in request.headers().get_all(COOKIE) {
            let header = header.to_str().map_err(|_| {
                ShedderError::Classification("cookie header is not visible ASCII".into())
            })?;
            let found = header
                .split(';')
                .filter_map(|pair| pair.trim().split_once('='))
                .any(|(name, value)| name == self.name && !value.is_empty());
            if found {
                return Ok(RequestKind::User);
            }
        }
        Ok(RequestKind::Anon)
    }
}
