//! API response envelope, error mapping and request DTOs.
//!
//! Every response is `{code, msg, data}`: code 0 on success, a stable
//! non-zero code on errors. Amount fields in request bodies are decimal
//! strings so precision survives the JSON boundary (plain numbers also
//! parse).

use axum::{Json, http::StatusCode, response::IntoResponse};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{OrderType, Side};
use crate::error::ExchangeError;

// ============================================================================
// Unified API Response Format
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 0 for success, non-zero for errors
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Handler return type: success tuple or error tuple, both enveloped.
pub type ApiResult<T> =
    Result<(StatusCode, Json<ApiResponse<T>>), (StatusCode, Json<ApiResponse<()>>)>;

#[inline]
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

// ============================================================================
// ApiError
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::AUTH_FAILED, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            msg,
        )
    }

    pub fn into_err<T>(self) -> ApiResult<T> {
        Err((
            self.status,
            Json(ApiResponse::<()>::error(self.code, self.message)),
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<()>::error(self.code, self.message));
        (self.status, body).into_response()
    }
}

impl From<ApiError> for (StatusCode, Json<ApiResponse<()>>) {
    fn from(err: ApiError) -> Self {
        (
            err.status,
            Json(ApiResponse::<()>::error(err.code, err.message)),
        )
    }
}

/// Engine errors map onto stable HTTP statuses and codes.
impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        match &err {
            ExchangeError::InvalidArgument(_) => ApiError::bad_request(err.to_string()),
            ExchangeError::InsufficientFunds(_) => ApiError::new(
                StatusCode::BAD_REQUEST,
                error_codes::INSUFFICIENT_BALANCE,
                err.to_string(),
            ),
            ExchangeError::UnknownSymbol(_) => ApiError::new(
                StatusCode::NOT_FOUND,
                error_codes::UNKNOWN_SYMBOL,
                err.to_string(),
            ),
            ExchangeError::NotFound(_) => ApiError::not_found(err.to_string()),
            ExchangeError::StaleTicker { .. } => ApiError::new(
                StatusCode::BAD_REQUEST,
                error_codes::STALE_TICKER,
                err.to_string(),
            ),
            ExchangeError::Transient(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::SERVICE_UNAVAILABLE,
                err.to_string(),
            ),
            ExchangeError::IllegalTransition { .. } | ExchangeError::Fatal(_) => {
                ApiError::internal(err.to_string())
            }
        }
    }
}

/// Standard API error codes
pub mod error_codes {
    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INSUFFICIENT_BALANCE: i32 = 1002;
    pub const STALE_TICKER: i32 = 1003;

    // Auth errors (2xxx)
    pub const AUTH_FAILED: i32 = 2002;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;
    pub const UNKNOWN_SYMBOL: i32 = 4002;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OrderReq {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type", default = "default_order_type")]
    pub order_type: OrderType,
    pub amount: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

#[derive(Debug, Deserialize)]
pub struct BalanceReq {
    #[serde(default)]
    pub free: Decimal,
    #[serde(default)]
    pub used: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct FundReq {
    /// Defaults to the configured cash asset.
    #[serde(default)]
    pub asset: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ModifyTickerReq {
    pub price: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub bid_volume: Option<Decimal>,
    #[serde(default)]
    pub ask_volume: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    #[serde(default)]
    pub status: Option<crate::core_types::OrderStatus>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub include_history: bool,
}

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    #[serde(default)]
    pub include_history: bool,
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    /// Comma-separated base assets, e.g. `BTC,ETH`.
    #[serde(default)]
    pub assets: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
}
