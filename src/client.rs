//! Wire types spoken to the inventory service, and the `Transport` trait
//! the reflectors consume. The transport itself (connection handling,
//! login, websocket framing) lives outside this crate.

use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;

/// A single query/mutation request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Request {
    pub query: String,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Map<String, JsonValue>>,
}

impl Request {
    pub fn new(operation_name: &str, query: String) -> Self {
        Self {
            query,
            operation_name: Some(operation_name.to_string()),
            variables: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResponseError>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Error)]
#[error("message: {message}, errcode: {code:?}")]
pub struct ResponseError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    LoginFailed,
    UserNotFound,
    UserPasswordIncorrect,
    NotMatchUser,
    LoadTokenFailed,
    WebsocketConnectError,
    #[serde(other)]
    Unknown,
}

/// True if any of the errors requires the transport to redo its login.
/// `WEBSOCKET_CONNECT_ERROR` is a reconnect, not a re-login, so it does
/// not count.
pub fn has_auth_error(errors: &[ResponseError]) -> bool {
    errors.iter().any(|err| {
        matches!(
            err.code,
            Some(ErrorCode::LoginFailed)
                | Some(ErrorCode::UserNotFound)
                | Some(ErrorCode::UserPasswordIncorrect)
                | Some(ErrorCode::NotMatchUser)
                | Some(ErrorCode::LoadTokenFailed)
        )
    })
}

/// One inbound message on a subscription connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: JsonValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Start,
    Data,
    Error,
    Complete,
}

/// The event pushed by the inventory service for one object mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationEvent {
    pub mutation: MutationType,
    pub node: JsonValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    Created,
    Deleted,
    Updated,
}

/// Connection to the inventory service. Implementations own authentication:
/// an auth error code must trigger a forced re-login inside the transport,
/// the caller only sees it as a failed call worth retrying.
pub trait Transport: Send + Sync + 'static {
    /// Executes one request/response call.
    fn query(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;

    /// Opens a push subscription. The returned channel yields inbound
    /// messages until the connection drops, which closes the channel.
    fn subscribe(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<mpsc::Receiver<Message>>> + Send;
}
