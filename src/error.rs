use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Hub error: {0}")]
    HubError(#[from] HubError),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] PipelineError),

    #[error("NLU error: {0}")]
    NluError(#[from] NluError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::HubError(HubError::AlreadyConnected(_)) => StatusCode::CONFLICT,
            AppError::HubError(HubError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::NluError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Bot {0} not found")]
    NotFound(String),

    #[error("Bot {0} is already connected")]
    AlreadyConnected(String),

    #[error("Connection for bot {0} is closed")]
    ConnectionClosed(String),

    #[error("Message sending failed: {0}")]
    SendError(String),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

#[derive(Error, Debug)]
pub enum NluError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("engine responded with status {0}")]
    ResponseError(u16),

    #[error("failed to decode response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for NluError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            NluError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            NluError::ResponseError(status.as_u16())
        } else {
            NluError::RequestFailed(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate record")]
    Duplicate,

    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => DatabaseError::Duplicate,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationError(err.to_string())
    }
}

/// Failure of one conversation pipeline run, tagged with the stage that failed.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to get/create client: {0}")]
    Client(#[source] DatabaseError),

    #[error("failed to get/create bot: {0}")]
    Bot(#[source] DatabaseError),

    #[error("failed to save client message: {0}")]
    SaveInbound(#[source] DatabaseError),

    #[error("nlu processing failed: {0}")]
    Nlu(#[source] NluError),
}
