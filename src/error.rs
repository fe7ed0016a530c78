use thiserror::Error;

/// Failure taxonomy for the conversation core.
///
/// `Transport` and `UploadFailed` are recoverable and surfaced to the caller
/// as-is; nothing in here retries them. `Unauthorized` means the credential
/// was rejected and the host application has to re-authenticate before
/// calling back in.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A participant identifier that does not parse as an integer. Room keys
    /// are derived from numeric ids, so there is nothing sensible to do with
    /// anything else.
    #[error("invalid participant identifier: {0}")]
    InvalidIdentifier(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("attachment upload failed: {0}")]
    UploadFailed(String),

    /// A send with neither text nor an attachment. Rejected locally before
    /// any network traffic.
    #[error("message needs text or an attachment")]
    EmptyMessage,
}
