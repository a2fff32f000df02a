use axum::http::HeaderMap;
use contacts_sync_core::registry::{GATEWAY_KEY_HEADER, USER_ID_HEADER};
use contacts_sync_core::OwnerId;

use crate::error::AppError;

/// Caller identity forwarded by the API gateway
#[derive(Debug, Clone)]
pub struct GatewayUser {
    pub owner_id: OwnerId,
}

/// Validate the gateway key and extract the forwarded user id
pub fn authenticate_gateway(headers: &HeaderMap, gateway_secret: &str) -> Result<GatewayUser, AppError> {
    let provided = header_value(headers, GATEWAY_KEY_HEADER)?
        .ok_or_else(|| AppError::unauthorized("Missing gateway key"))?;
    if !constant_time_eq(provided.as_bytes(), gateway_secret.as_bytes()) {
        return Err(AppError::unauthorized("Invalid gateway key"));
    }

    let user_id = header_value(headers, USER_ID_HEADER)?
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::unauthorized("Missing user context"))?;

    Ok(GatewayUser {
        owner_id: OwnerId::from(user_id),
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::unauthorized(format!("{name} header is not valid UTF-8")))
        })
        .transpose()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
