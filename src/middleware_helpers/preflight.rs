use axum::{
    body::Body,
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::Response,
};

/// Answers every `OPTIONS` request with `204 No Content`.
///
/// Must wrap the CORS layer so the preflight headers it writes are kept while the
/// status and body are normalized. Plain `OPTIONS` requests that no route handles
/// would otherwise surface as `405`.
pub async fn preflight_no_content_middleware(request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }

    let response = next.run(request).await;
    let (mut parts, _) = response.into_parts();
    parts.status = StatusCode::NO_CONTENT;
    parts.headers.remove(http::header::CONTENT_LENGTH);
    parts.headers.remove(http::header::CONTENT_TYPE);
    Response::from_parts(parts, Body::empty())
}
