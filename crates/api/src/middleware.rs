use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use taskforge_core::PrincipalId;

use crate::context::PrincipalContext;

/// Header carrying the caller's principal id.
pub const PRINCIPAL_HEADER: &str = "x-principal-id";

pub async fn auth_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let principal_id = extract_principal(req.headers())?;

    req.extensions_mut().insert(PrincipalContext::new(principal_id));

    Ok(next.run(req).await)
}

fn extract_principal(headers: &HeaderMap) -> Result<PrincipalId, StatusCode> {
    let header = headers
        .get(PRINCIPAL_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let raw = header.trim();
    if raw.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let uuid = Uuid::parse_str(raw).map_err(|_| StatusCode::UNAUTHORIZED)?;
    if uuid.is_nil() {
        // Reserved for work no caller submitted directly.
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(PrincipalId::from_uuid(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn valid_uuid_becomes_principal() {
        let id = Uuid::now_v7();
        assert_eq!(
            extract_principal(&headers(&id.to_string())),
            Ok(PrincipalId::from_uuid(id))
        );
    }

    #[test]
    fn missing_malformed_or_nil_is_unauthorized() {
        assert_eq!(extract_principal(&HeaderMap::new()), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_principal(&headers("  ")), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_principal(&headers("not-a-uuid")), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(
            extract_principal(&headers(&Uuid::nil().to_string())),
            Err(StatusCode::UNAUTHORIZED)
        );
    }
}
