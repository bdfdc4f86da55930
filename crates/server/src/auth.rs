//! Bearer token middleware.
//!
//! When a token is configured, upgrades on `/ws` must carry
//! `Authorization: Bearer <token>` or `?token=<token>`. Rejected requests get
//! 401 before the WebSocket upgrade. `/health` stays unauthenticated.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if request_token_matches(&req, &expected_token) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        "Rejected request with missing or invalid token"
    );
    Err(StatusCode::UNAUTHORIZED)
}

fn request_token_matches(req: &Request<Body>, expected: &str) -> bool {
    let header_token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if header_token.is_some_and(|token| constant_time_eq(token, expected)) {
        return true;
    }

    req.uri()
        .query()
        .into_iter()
        .flat_map(|query| query.split('&'))
        .filter_map(|pair| pair.strip_prefix("token="))
        .any(|token| {
            urlencoding::decode(token)
                .map(|decoded| constant_time_eq(&decoded, expected))
                .unwrap_or(false)
        })
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn accepts_header_or_query_token() {
        assert!(request_token_matches(&request("/ws", Some("s3cret")), "s3cret"));
        assert!(request_token_matches(
            &request("/ws?clientId=c1&token=s3cret", None),
            "s3cret"
        ));
        assert!(request_token_matches(
            &request("/ws?token=a%2Bb", None),
            "a+b"
        ));
    }

    #[test]
    fn rejects_missing_or_wrong_token() {
        assert!(!request_token_matches(&request("/ws", None), "s3cret"));
        assert!(!request_token_matches(&request("/ws", Some("nope")), "s3cret"));
        assert!(!request_token_matches(
            &request("/ws?token=s3cre", None),
            "s3cret"
        ));
    }
}
