//! HTTP handlers for the Moteve Client Application (MCA).
//!
//! The mobile client talks plain POSTs with `Moteve-*` headers and reads
//! short `text/html` bodies back. Header names and the marker strings
//! (`AUTH_ERROR`, `MISSING_TOKEN`, `WRONG_TOKEN`, `OK`) are the wire
//! contract with already deployed clients.

use crate::{
    errors::AppError,
    models::sequence::SequenceId,
    services::{part_store::ByteStream, upload_service::UploadError},
    state::AppState,
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tracing::info;

pub const AUTH_HEADER: &str = "moteve-auth";
pub const TOKEN_HEADER: &str = "moteve-token";
pub const SEQUENCE_HEADER: &str = "moteve-sequence";
pub const PART_HEADER: &str = "moteve-part";

const AUTH_ERROR: &str = "AUTH_ERROR";
const MISSING_TOKEN: &str = "MISSING_TOKEN";
const WRONG_TOKEN: &str = "WRONG_TOKEN";
const CLOSE_PREFIX: &str = "close_";
const DEFAULT_DEVICE: &str = "upload";

/// Credentials from a `Moteve-Auth` header: `email\password[\description]`.
///
/// The password runs from the first to the last backslash, so it may itself
/// contain backslashes when a description is present.
#[derive(Debug, PartialEq, Eq)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
    description: Option<&'a str>,
}

impl<'a> Credentials<'a> {
    fn parse(raw: &'a str) -> Option<Self> {
        let first = raw.find('\\')?;
        if first == 0 {
            return None;
        }
        let last = raw.rfind('\\')?;
        let email = &raw[..first];
        if first == last {
            return Some(Self {
                email,
                password: &raw[first + 1..],
                description: None,
            });
        }
        Some(Self {
            email,
            password: &raw[first + 1..last],
            description: Some(&raw[last + 1..]),
        })
    }
}

/// What a `Moteve-Sequence` header asks for.
#[derive(Debug, PartialEq, Eq)]
enum SequenceCommand<'a> {
    New,
    Close(&'a str),
    Part(&'a str),
}

impl<'a> SequenceCommand<'a> {
    fn parse(raw: &'a str) -> Self {
        if raw == "new" {
            Self::New
        } else if let Some(id) = raw.strip_prefix(CLOSE_PREFIX) {
            Self::Close(id)
        } else {
            Self::Part(raw)
        }
    }
}

/// `POST /mca/register.htm`
///
/// Authenticates `Moteve-Auth: email\password\description` and registers
/// the device. The token (or `AUTH_ERROR`) is returned in the `Moteve-Token`
/// header and as the body.
pub async fn register_mca(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let raw = header_str(&headers, AUTH_HEADER)
        .ok_or_else(|| AppError::missing_header("Moteve-Auth"))?;
    let creds = Credentials::parse(raw)
        .filter(|c| c.description.is_some())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "Malformed Moteve-Auth parameter")
        })?;
    let description = creds.description.unwrap_or_default();

    info!(email = creds.email, description, "Authenticating MCA");
    let Some(user) = state.users.authenticate(creds.email, creds.password).await? else {
        info!(email = creds.email, "MCA authentication failed");
        return Ok(token_marker(StatusCode::UNAUTHORIZED, AUTH_ERROR));
    };

    let token = state.users.issue_token(&user, description).await?;
    info!(email = %user.email, "MCA authentication successful");
    Ok(token_marker(StatusCode::OK, &token))
}

/// `POST /mca/listGroups.htm`
///
/// Body holds the user's group names, each followed by a backslash.
pub async fn list_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(token) = header_str(&headers, TOKEN_HEADER) else {
        return Ok(token_marker(StatusCode::UNAUTHORIZED, MISSING_TOKEN));
    };
    let Some(user) = state.users.resolve_user(token).await? else {
        return Ok(token_marker(StatusCode::UNAUTHORIZED, WRONG_TOKEN));
    };

    let body: String = state
        .users
        .list_group_names(&user)
        .await?
        .into_iter()
        .map(|name| name + "\\")
        .collect();
    Ok(text_response(StatusCode::OK, body))
}

/// `POST /mca/upload.htm`
///
/// Dispatches on `Moteve-Sequence`:
/// - `new` opens a sequence and returns its id,
/// - `close_<id>` closes it,
/// - `<id>` with `Moteve-Part: <n>` stores the request body as part `n`.
pub async fn upload_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let raw = header_str(&headers, SEQUENCE_HEADER)
        .ok_or(UploadError::MissingHeader("Moteve-Sequence"))?;

    match SequenceCommand::parse(raw) {
        SequenceCommand::New => open_sequence(&state, &headers).await,
        SequenceCommand::Close(id) => {
            let id = parse_sequence(id)?;
            let token = require_token(&headers)?;
            let ack = state.uploads.close(id, token).await?;
            Ok(text_response(StatusCode::OK, format!("{} closed\n", ack.sequence_id)))
        }
        SequenceCommand::Part(id) => {
            let id = parse_sequence(id)?;
            let token = require_token(&headers)?;
            let part = header_str(&headers, PART_HEADER);

            let ack = state
                .uploads
                .accept_raw_part(id, part, token, body_stream(body))
                .await?;

            let mut response = text_response(StatusCode::OK, "OK\n");
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", ack.md5)) {
                response.headers_mut().insert(header::ETAG, value);
            }
            Ok(response)
        }
    }
}

/// `Moteve-Sequence: new`. The owner token comes from `Moteve-Token`, or is
/// issued on the spot from `Moteve-Auth` credentials and sent back.
async fn open_sequence(state: &AppState, headers: &HeaderMap) -> Result<Response, AppError> {
    let (token, issued) = match header_str(headers, TOKEN_HEADER) {
        Some(token) => (token.to_string(), false),
        None => {
            let raw = header_str(headers, AUTH_HEADER)
                .ok_or(UploadError::MissingHeader("Moteve-Auth"))?;
            let creds = Credentials::parse(raw).ok_or(UploadError::Unauthorized)?;
            let user = state
                .users
                .authenticate(creds.email, creds.password)
                .await?
                .ok_or(UploadError::Unauthorized)?;
            let description = creds.description.unwrap_or(DEFAULT_DEVICE);
            (state.users.issue_token(&user, description).await?, true)
        }
    };

    let id = state.uploads.open(&token).await?;

    let mut response = text_response(StatusCode::OK, id.to_string());
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        headers.insert(HeaderName::from_static(SEQUENCE_HEADER), value);
    }
    if issued {
        if let Ok(value) = HeaderValue::from_str(&token) {
            headers.insert(HeaderName::from_static(TOKEN_HEADER), value);
        }
    }
    Ok(response)
}

fn parse_sequence(raw: &str) -> Result<SequenceId, UploadError> {
    SequenceId::parse(raw).ok_or_else(|| UploadError::NotFound(raw.to_string()))
}

fn require_token(headers: &HeaderMap) -> Result<&str, UploadError> {
    header_str(headers, TOKEN_HEADER).ok_or(UploadError::MissingHeader("Moteve-Token"))
}

/// Non-empty header value as text.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn body_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other)))
}

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response {
    let body: Body = body.into();
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    response
}

/// Marker or token echoed in both `Moteve-Token` and the body.
fn token_marker(status: StatusCode, value: &str) -> Response {
    let mut response = text_response(status, value.to_string());
    if let Ok(header_value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TOKEN_HEADER), header_value);
    }
    response
}
