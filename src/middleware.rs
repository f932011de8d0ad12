/**
 * HTTP middleware for the per-backend routes: panic recovery, access logging
 * and bearer-token authentication.
 *
 * Composition order is fixed by [`wrap`]: recover is outermost (first to run,
 * last to return), then logging, then auth, then the SSE handlers.
 */
use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    Router,
};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

use crate::utils::panic_message;

/// Apply the backend's middleware chain to its route tree. Auth is installed
/// only for a non-empty token set, logging only when enabled; recovery is
/// always installed and always outermost.
pub fn wrap(router: Router, name: &str, log_enabled: bool, tokens: &[String]) -> Router {
    let mut router = router;
    if !tokens.is_empty() {
        router = with_bearer_auth(router, tokens);
    }
    if log_enabled {
        router = with_request_logging(router, name);
    }
    with_recovery(router, name)
}

/// Reject requests that do not carry `Authorization: Bearer <token>` with a
/// token from `tokens`. Missing header, wrong scheme and unknown tokens all
/// yield 401.
pub fn with_bearer_auth(router: Router, tokens: &[String]) -> Router {
    let tokens: Arc<HashSet<String>> = Arc::new(tokens.iter().cloned().collect());
    router.layer(middleware::from_fn(move |request: Request, next: Next| {
        let tokens = tokens.clone();
        async move {
            let authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .is_some_and(|token| tokens.contains(token));
            if !authorized {
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }
            next.run(request).await
        }
    }))
}

/// One log line per request with the backend name, method and path.
pub fn with_request_logging(router: Router, name: &str) -> Router {
    let name: Arc<str> = Arc::from(name);
    router.layer(middleware::from_fn(move |request: Request, next: Next| {
        let name = name.clone();
        async move {
            info!(
                "<{}> Request [{}] {}",
                name,
                request.method(),
                request.uri().path()
            );
            next.run(request).await
        }
    }))
}

/// Convert a panic anywhere downstream into a 500 response so a broken
/// handler cannot take the gateway process down.
pub fn with_recovery(router: Router, name: &str) -> Router {
    let name: Arc<str> = Arc::from(name);
    router.layer(middleware::from_fn(move |request: Request, next: Next| {
        let name = name.clone();
        async move {
            match AssertUnwindSafe(next.run(request)).catch_unwind().await {
                Ok(response) => response,
                Err(panic) => {
                    error!(
                        "<{}> Recovered from panic: {}",
                        name,
                        panic_message(panic.as_ref())
                    );
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get};
    use tower::ServiceExt;

    fn ok_app() -> Router {
        Router::new().route("/x", get(|| async { "ok" }))
    }

    fn request(auth: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri("/x");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn auth_rejects_missing_header() {
        use http_body_util::BodyExt;

        let router = with_bearer_auth(ok_app(), &["SECRET".into()]);
        let response = router.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Unauthorized");
    }

    #[tokio::test]
    async fn auth_rejects_unknown_token() {
        let router = with_bearer_auth(ok_app(), &["SECRET".into()]);
        let response = router.oneshot(request(Some("Bearer WRONG"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_rejects_wrong_scheme() {
        let router = with_bearer_auth(ok_app(), &["SECRET".into()]);
        let response = router.oneshot(request(Some("Basic SECRET"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_accepts_known_token() {
        let router = with_bearer_auth(ok_app(), &["SECRET".into()]);
        let response = router
            .oneshot(request(Some("Bearer SECRET")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_trims_the_token() {
        let router = with_bearer_auth(ok_app(), &["SECRET".into()]);
        let response = router
            .oneshot(request(Some("Bearer  SECRET ")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn recovery_turns_panics_into_500() {
        let panicking = Router::new().route("/x", get(|| async {
            panic!("boom");
            #[allow(unreachable_code)]
            ()
        }));
        let router = with_recovery(panicking, "test");

        let response = router.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // The route keeps serving after a panic.
        let response = router.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn wrap_applies_auth_and_recovery_together() {
        let panicking = Router::new().route("/x", get(|| async {
            panic!("boom");
            #[allow(unreachable_code)]
            ()
        }));
        let router = wrap(panicking, "test", true, &["SECRET".into()]);

        // Auth runs before the handler: no token means 401, not 500.
        let response = router.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // With a valid token the panic reaches the recovery layer.
        let response = router
            .oneshot(request(Some("Bearer SECRET")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn wrap_without_tokens_skips_auth() {
        let router = wrap(ok_app(), "test", false, &[]);
        let response = router.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn single_wrap_installs_a_single_auth_layer() {
        // One wrapped request with one valid token passes straight through:
        // exactly one layer demands credentials.
        let router = wrap(ok_app(), "test", false, &["SECRET".into()]);
        let response = router
            .oneshot(request(Some("Bearer SECRET")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
