//! Room selection during the WebSocket upgrade.
//!
//! Clients pick a room with the request path, `ws://host:port/<room>`, or
//! with a `room` query parameter when the path is empty. Requests without a
//! usable room id are answered with `400 Bad Request` and never reach a room.

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{
    Callback, ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("request carries no room id")]
    MissingRoomId,
    #[error("room id exceeds {limit} bytes")]
    RoomIdTooLong { limit: usize },
    #[error("room id contains control characters")]
    InvalidRoomId,
}

/// Extract and validate the room id from a request URI.
pub fn room_id_from_uri(uri: &Uri, max_len: usize) -> Result<String, GatewayError> {
    let path = uri.path().trim_start_matches('/');
    let candidate = if path.is_empty() {
        uri.query()
            .and_then(|query| {
                query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("room="))
            })
            .unwrap_or_default()
    } else {
        path
    };

    if candidate.is_empty() {
        return Err(GatewayError::MissingRoomId);
    }
    if candidate.len() > max_len {
        return Err(GatewayError::RoomIdTooLong { limit: max_len });
    }
    if candidate.chars().any(char::is_control) {
        return Err(GatewayError::InvalidRoomId);
    }
    Ok(candidate.to_string())
}

/// Handshake callback that resolves the room id and rejects the upgrade
/// when there is none.
pub struct RoomSelector<'a> {
    max_len: usize,
    outcome: &'a mut Option<Result<String, GatewayError>>,
}

impl<'a> RoomSelector<'a> {
    pub fn new(max_len: usize, outcome: &'a mut Option<Result<String, GatewayError>>) -> Self {
        Self { max_len, outcome }
    }
}

impl Callback for RoomSelector<'_> {
    fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let result = room_id_from_uri(request.uri(), self.max_len);
        let reply = match &result {
            Ok(_) => Ok(response),
            Err(e) => {
                let mut error = ErrorResponse::new(Some(e.to_string()));
                *error.status_mut() = StatusCode::BAD_REQUEST;
                Err(error)
            }
        };
        *self.outcome = Some(result);
        reply
    }
}
