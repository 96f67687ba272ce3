//! JSON endpoints refuse non-JSON bodies with 415. The OAuth token and
//! revocation endpoints are exempt: RFC 6749 mandates form encoding there.

use axum::{
    extract::Request,
    http::{header, Method},
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;

const FORM_ENDPOINTS: [&str; 2] = ["/api/auth/token", "/api/auth/revoke"];

pub async fn content_type_guard(request: Request, next: Next) -> Result<Response, ApiError> {
    let method = request.method();
    let needs_body = matches!(*method, Method::POST | Method::PUT | Method::PATCH);
    let path = request.uri().path();

    if needs_body && !FORM_ENDPOINTS.contains(&path) {
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let is_json =
            content_type.starts_with("application/json") || content_type.is_empty();
        if !is_json {
            return Err(ApiError::unsupported_media(format!(
                "expected application/json, got {content_type}"
            )));
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::post, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/api/collections/x", post(|| async { "ok" }))
            .route("/api/auth/token", post(|| async { "ok" }))
            .layer(middleware::from_fn(content_type_guard))
    }

    #[tokio::test]
    async fn non_json_bodies_get_415() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/collections/x")
                    .header("content-type", "text/plain")
                    .body(Body::from("hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 415);
    }

    #[tokio::test]
    async fn form_is_allowed_on_the_token_endpoint() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/auth/token")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("grant_type=authorization_code"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
