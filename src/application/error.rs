use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{
    application::items::ItemError, application::settings::SettingsError, config::LoadError,
    infra::error::InfraError,
};

/// Diagnostic detail carried in response extensions for `log_responses`.
///
/// Never serialized into the response body.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn new(source: &'static str, status: StatusCode) -> Self {
        Self {
            source,
            status,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Append `error` and every `source()` below it.
    pub fn with_chain(mut self, error: &dyn StdError) -> Self {
        let mut current = Some(error);
        while let Some(inner) = current {
            self.messages.push(inner.to_string());
            current = inner.source();
        }
        self
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Client-facing error with a stable `code` and a fixed public message.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        public_message: &'static str,
    ) -> Self {
        Self {
            status,
            code,
            public_message,
            report: ErrorReport::new(source, status),
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.report = self.report.with_message(detail);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.public_message }
        });
        let mut response = (self.status, Json(body)).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<ItemError> for HttpError {
    fn from(error: ItemError) -> Self {
        let detail = error.to_string();
        match error {
            ItemError::NotFound(_) => HttpError::new(
                "application::items",
                StatusCode::NOT_FOUND,
                "not_found",
                "Item not found",
            ),
            ItemError::Invalid(_) => HttpError::new(
                "application::items",
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_input",
                "Invalid item",
            ),
        }
        .detail(detail)
    }
}

impl From<SettingsError> for HttpError {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::NotAnObject => HttpError::new(
                "application::settings",
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_input",
                "Settings patch must be a JSON object",
            )
            .detail(error.to_string()),
        }
    }
}

/// Process-level failure reported by `main` before exiting.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
