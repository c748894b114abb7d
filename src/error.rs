use thiserror::Error;

/// Failures of the AI completion backend.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// No credential configured; fatal for the call, not for the process.
    #[error("AI API key is not configured")]
    Config,
    #[error("AI service timed out after {attempts} attempt(s)")]
    UpstreamTimeout { attempts: u32 },
    #[error("AI service call failed after {attempts} attempt(s): {detail}")]
    UpstreamError { attempts: u32, detail: String },
    /// A 2xx response that does not carry `choices[0].message.content`.
    #[error("AI service returned a malformed response: {0}")]
    UpstreamFormat(String),
}

/// Failures talking to the chat platform's outbound API.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to obtain tenant access token: {0}")]
    Token(String),
    #[error("chat platform request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat platform rejected the request (code {code}): {msg}")]
    Api { code: i64, msg: String },
    #[error("chat platform response could not be decoded: {0}")]
    Decode(String),
}

/// Terminal conditions of a background task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("thread creation failed: {0}")]
    ThreadCreationFailed(String),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}
