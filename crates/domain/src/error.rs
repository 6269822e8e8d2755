/// Shared error type used across all taskmesh crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("redis: {0}")]
    Redis(String),

    #[error("docker: {0}")]
    Docker(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("permission: {0}")]
    Permission(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("dispatch: {0}")]
    Dispatch(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience for upstream HTTP failures where only the status and a
    /// short body excerpt matter.
    pub fn http_status(status: u16, detail: &str) -> Self {
        let detail = if detail.len() > 500 {
            &detail[..500]
        } else {
            detail
        };
        Error::Http(format!("status {status}: {detail}"))
    }
}
