//! IPC client for communicating with the subtext service.

use std::time::Duration;

use subtext_common::ipc::{get_socket_path, read_json, write_json, Request, Response};

use crate::exit_codes::ExitCode;

/// Transcription can legitimately take a long while on big inputs; the
/// client waits generously before declaring the service stuck.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// Error type for service client operations.
#[derive(Debug, Clone)]
pub enum ServiceError {
    /// Connection to service failed
    ConnectionFailed(String),
    /// Failed to send request
    SendFailed(String),
    /// Failed to receive response
    ReceiveFailed(String),
    /// Service returned an error
    RemoteError(String),
    /// Request timed out
    Timeout,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            ServiceError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            ServiceError::ReceiveFailed(msg) => write!(f, "Receive failed: {}", msg),
            ServiceError::RemoteError(msg) => write!(f, "Service error: {}", msg),
            ServiceError::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    /// Convert to an appropriate exit code.
    pub fn to_exit_code(&self) -> ExitCode {
        match self {
            ServiceError::ConnectionFailed(_) | ServiceError::Timeout => {
                ExitCode::ServiceConnectionFailed
            }
            ServiceError::SendFailed(_) | ServiceError::ReceiveFailed(_) => {
                ExitCode::ServiceConnectionFailed
            }
            ServiceError::RemoteError(msg) => {
                if msg.contains("Admission timed out") {
                    ExitCode::AdmissionTimedOut
                } else if msg.contains("Invalid") {
                    ExitCode::InvalidArguments
                } else {
                    ExitCode::TranscriptionFailed
                }
            }
        }
    }
}

/// One-shot client: connect, send a request, await the response.
pub struct ServiceClient;

impl ServiceClient {
    pub fn new() -> Self {
        Self
    }

    #[cfg(unix)]
    pub async fn request(&self, request: Request) -> Result<Response, ServiceError> {
        use tokio::net::UnixStream;

        let socket_path = get_socket_path();
        let mut stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            ServiceError::ConnectionFailed(format!(
                "{} (is subtext-service running?): {}",
                socket_path.display(),
                e
            ))
        })?;

        write_json(&mut stream, &request)
            .await
            .map_err(|e| ServiceError::SendFailed(e.to_string()))?;

        let response = tokio::time::timeout(RESPONSE_TIMEOUT, read_json(&mut stream))
            .await
            .map_err(|_| ServiceError::Timeout)?
            .map_err(|e| ServiceError::ReceiveFailed(e.to_string()))?;

        match response {
            Response::Error { message } => Err(ServiceError::RemoteError(message)),
            other => Ok(other),
        }
    }

    #[cfg(not(unix))]
    pub async fn request(&self, _request: Request) -> Result<Response, ServiceError> {
        Err(ServiceError::ConnectionFailed(
            "the subtext service only runs on Unix hosts".to_string(),
        ))
    }
}

impl Default for ServiceClient {
    fn default() -> Self {
        Self::new()
    }
}
