//! Local HTTP listener
//!
//! ```text
//! tunnel ──► :8080 ──► TraceLayer ──► access_gate ──► proxy_handler ──► target
//!                                        │
//!                                        └── 401 lock screen / 303 login
//! ```

use crate::gate::{access_gate, AccessGate};
use crate::proxy::{proxy_handler, ReverseProxy};
use axum::{middleware, Router};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Build the gate → proxy router
pub fn build_router(gate: Arc<AccessGate>, proxy: Arc<ReverseProxy>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(proxy)
        .layer(middleware::from_fn_with_state(gate, access_gate))
        .layer(TraceLayer::new_for_http())
}

/// Bind the listener on all interfaces
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
}

/// Serve until the listener fails, exposing client addresses to the proxy
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::gate::{hash_password, COOKIE_NAME, LOGIN_PATH};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    /// Router whose upstream is unreachable; anything forwarded becomes a 502
    fn app(password: Option<&str>) -> (Router, Arc<Counters>) {
        let counters = Arc::new(Counters::new());
        let proxy = Arc::new(ReverseProxy::new("http://127.0.0.1:9", counters.clone()).unwrap());
        let gate = Arc::new(AccessGate::new(password.map(String::from)));
        (build_router(gate, proxy), counters)
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(LOGIN_PATH)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_inert_gate_forwards_login_path() {
        let (app, counters) = app(None);

        let response = app.oneshot(login_request("password=x")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(counters.snapshot().requests, 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_gets_lock_screen() {
        let (app, counters) = app(Some("hunter2"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/reports?page=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8_lossy(&body);
        assert!(html.contains(r#"value="/reports?page=2""#));
        assert!(!html.contains("Invalid password"));
        assert_eq!(counters.snapshot().requests, 0);
    }

    #[tokio::test]
    async fn test_valid_cookie_is_forwarded() {
        let (app, counters) = app(Some("hunter2"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(
                        header::COOKIE,
                        format!("{}={}", COOKIE_NAME, hash_password("hunter2")),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(counters.snapshot().requests, 1);
    }

    #[tokio::test]
    async fn test_correct_password_sets_cookie_and_redirects() {
        let (app, _) = app(Some("hunter2"));

        let response = app
            .oneshot(login_request("password=hunter2&redirect=%2Fdocs"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/docs");

        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("{}={}", COOKIE_NAME, hash_password("hunter2"))));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Path=/"));
    }

    #[tokio::test]
    async fn test_empty_redirect_defaults_to_root() {
        let (app, _) = app(Some("hunter2"));

        let response = app
            .oneshot(login_request("password=hunter2&redirect="))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn test_unencodable_redirect_defaults_to_root() {
        let (app, _) = app(Some("hunter2"));

        let response = app
            .oneshot(login_request("password=hunter2&redirect=%2Fdocs%0Aevil"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
        assert!(response.headers().get(header::SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let (app, counters) = app(Some("hunter2"));

        let response = app
            .oneshot(login_request("password=guess&redirect=%2F"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("Invalid password"));
        assert_eq!(counters.snapshot().requests, 0);
    }
}
