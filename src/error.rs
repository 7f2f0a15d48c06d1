use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::entities::ride::RideStatus;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot {action} a ride in status {from}")]
    InvalidTransition { from: RideStatus, action: &'static str },

    #[error("No drivers available")]
    NoDriversAvailable,

    #[error("Offer expired")]
    OfferExpired,

    #[error("Offer already resolved")]
    OfferAlreadyResolved,

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Route unavailable: {0}")]
    RouteUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, used in socket `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::NoDriversAvailable => "no_drivers_available",
            AppError::OfferExpired => "offer_expired",
            AppError::OfferAlreadyResolved => "offer_already_resolved",
            AppError::Authentication(_) => "authentication_error",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::RouteUnavailable(_) => "route_unavailable",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::NoDriversAvailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::OfferExpired => StatusCode::GONE,
            AppError::OfferAlreadyResolved => StatusCode::CONFLICT,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RouteUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a client; internals are masked.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Internal database error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "Internal server error".to_string()
            }
            AppError::RouteUnavailable(e) => {
                tracing::warn!("Routing provider unavailable: {}", e);
                self.to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.public_message(),
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
