use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use log::debug;

use super::Credentials;
use crate::identity;

pub const GUEST_ID_HEADER: &str = "x-guest-id";
pub const GUEST_NAME_HEADER: &str = "x-guest-name";

/// Resolves the caller of a request-style endpoint and stores it as `Extension<Participant>`.
pub async fn resolve(
    identity_service: State<identity::Service>,
    mut req: Request,
    next: Next,
) -> crate::Result<Response> {
    let credentials = credentials_from_headers(req.headers());
    let participant = identity_service.resolve(&credentials).await?;
    debug!("request by {}", participant.key());

    req.extensions_mut().insert(participant);
    Ok(next.run(req).await)
}

pub fn credentials_from_headers(headers: &HeaderMap) -> Credentials {
    if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() {
        return Credentials::Token(bearer.token().to_string());
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    match header(GUEST_ID_HEADER) {
        Some(guest_id) => Credentials::Guest {
            guest_id,
            guest_name: header(GUEST_NAME_HEADER),
        },
        None => Credentials::Anonymous,
    }
}
