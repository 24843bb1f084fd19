//! Access Gate
//!
//! Optional password protection in front of the proxy.
//!
//! # Auth model
//!
//! - **No password configured**: every request passes through untouched.
//! - **Cookie**: `localrun_auth` holds the hex SHA-256 of the password.
//!   Nothing is stored server-side; a request is authorized when its cookie
//!   equals a freshly computed hash.
//! - **Login**: `POST /localrun-login` with `password` and `redirect` form
//!   fields. Success sets the cookie and answers `303 See Other`.
//!
//! The hash is unsalted and deterministic, so the cookie is effectively a
//! password-equivalent bearer token and the comparison is not constant time.
//! Deployments that need more should use a keyed comparison.

use crate::lockscreen;
use axum::{
    extract::{FromRequest, Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use cookie::time::{Duration, OffsetDateTime};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Auth cookie name
pub const COOKIE_NAME: &str = "localrun_auth";

/// Login form target
pub const LOGIN_PATH: &str = "/localrun-login";

/// Cookie lifetime (24 hours)
const COOKIE_TTL_HOURS: i64 = 24;

const INVALID_PASSWORD: &str = "Invalid password";

/// Hex-encoded SHA-256 of the password
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Login form fields
#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub redirect: String,
}

/// Password gate state
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    password: Option<String>,
}

impl AccessGate {
    /// Create a gate; an empty password leaves it inert
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.password.is_some()
    }

    /// Whether the request carries a valid auth cookie (always true when inert)
    pub fn is_authorized(&self, jar: &CookieJar) -> bool {
        match &self.password {
            None => true,
            Some(password) => jar
                .get(COOKIE_NAME)
                .is_some_and(|c| c.value() == hash_password(password)),
        }
    }

    /// Auth cookie for a successful login
    pub fn build_cookie(password: &str) -> Cookie<'static> {
        Cookie::build((COOKIE_NAME, hash_password(password)))
            .path("/")
            .expires(OffsetDateTime::now_utc() + Duration::hours(COOKIE_TTL_HOURS))
            .http_only(true)
            .same_site(SameSite::Strict)
            .build()
    }

    async fn login(&self, password: &str, jar: CookieJar, req: Request) -> Response {
        let form = match Form::<LoginForm>::from_request(req, &()).await {
            Ok(Form(form)) => form,
            Err(rejection) => {
                debug!("Unreadable login form: {}", rejection);
                LoginForm::default()
            }
        };

        // Targets that cannot be a Location header fall back to the root
        let redirect = if form.redirect.is_empty() || HeaderValue::from_str(&form.redirect).is_err()
        {
            "/".to_string()
        } else {
            form.redirect
        };

        if form.password != password {
            warn!("Invalid tunnel password attempt");
            return lock_screen(Some(INVALID_PASSWORD), &redirect);
        }

        info!("Tunnel login accepted, redirecting to {}", redirect);
        let jar = jar.add(Self::build_cookie(password));
        (jar, Redirect::to(&redirect)).into_response()
    }
}

/// 401 with the lock screen
fn lock_screen(error: Option<&str>, redirect: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Html(lockscreen::render(error, redirect)),
    )
        .into_response()
}

/// Gate middleware: forward authorized requests, intercept the rest
pub async fn access_gate(
    State(gate): State<Arc<AccessGate>>,
    jar: CookieJar,
    req: Request,
    next: Next,
) -> Response {
    let Some(password) = gate.password.as_deref() else {
        return next.run(req).await;
    };

    if gate.is_authorized(&jar) {
        return next.run(req).await;
    }

    if req.method() == Method::POST && req.uri().path() == LOGIN_PATH {
        return gate.login(password, jar, req).await;
    }

    let redirect = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    lock_screen(None, &redirect)
}
