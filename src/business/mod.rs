//! Business errors and the response envelope.
//!
//! Domain-rule violations are raised as a [`BusinessError`] built from an
//! [`ErrorCode`]. [`translate`] is the one place that turns any crate error
//! into the `{ code, message, data }` envelope and its HTTP status.

mod code;
#[cfg(feature = "http")]
mod http;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

pub use code::{
    ChallengeMissionErrorCode, ChallengeParticipantErrorCode, ChallengeRoomErrorCode,
    ChallengeVideoErrorCode, CommentErrorCode, CommentLikeErrorCode, CommonErrorCode, ErrorCode,
};

use crate::error::Error;

/// A domain-rule violation with a client-facing error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessError {
    status: u16,
    code: &'static str,
    message: &'static str,
    detail: Option<String>,
}

impl BusinessError {
    pub fn new<C: ErrorCode>(code: C) -> Self {
        BusinessError {
            status: code.status(),
            code: code.code(),
            message: code.message(),
            detail: None,
        }
    }

    /// Attach detail text. It is logged, never sent to clients.
    pub fn with_detail<C: ErrorCode>(code: C, detail: impl Into<String>) -> Self {
        BusinessError {
            detail: Some(detail.into()),
            ..Self::new(code)
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Whether this error was raised with `code`.
    pub fn is<C: ErrorCode>(&self, code: C) -> bool {
        self.code == code.code()
    }
}

impl fmt::Display for BusinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "[{}] {} - {}", self.code, self.message, detail),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl std::error::Error for BusinessError {}

macro_rules! from_error_codes {
    ($($code:ty),* $(,)?) => {
        $(
            impl From<$code> for BusinessError {
                fn from(code: $code) -> Self {
                    BusinessError::new(code)
                }
            }
        )*
    };
}

from_error_codes!(
    CommonErrorCode,
    ChallengeRoomErrorCode,
    ChallengeParticipantErrorCode,
    ChallengeVideoErrorCode,
    ChallengeMissionErrorCode,
    CommentErrorCode,
    CommentLikeErrorCode,
);

pub const SUCCESS_CODE: &str = "200";
pub const SUCCESS_MESSAGE: &str = "Processed successfully.";

/// The uniform response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData<T> {
    pub code: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ResponseData<T> {
    pub fn success(data: T) -> Self {
        Self::success_with(SUCCESS_MESSAGE, data)
    }

    pub fn success_with(message: impl Into<String>, data: T) -> Self {
        ResponseData {
            code: SUCCESS_CODE.to_string(),
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error<C: ErrorCode + ?Sized>(code: &C) -> Self {
        ResponseData {
            code: code.code().to_string(),
            message: code.message().to_string(),
            data: None,
        }
    }
}

impl ResponseData<()> {
    pub fn from_business(err: &BusinessError) -> Self {
        ResponseData {
            code: err.code.to_string(),
            message: err.message.to_string(),
            data: None,
        }
    }
}

/// Turn any crate error into a status and an error envelope.
///
/// Business errors keep their code. Everything else is reported as the
/// generic internal error, with the details only in the log.
pub fn translate(err: &Error) -> (u16, ResponseData<()>) {
    match err {
        Error::Business(business) => {
            error!(code = business.code(), detail = ?business.detail(), "business error");
            (business.status(), ResponseData::from_business(business))
        }
        other => {
            error!(error = %other, "unexpected error");
            let code = CommonErrorCode::InternalServerError;
            (code.status(), ResponseData::error(&code))
        }
    }
}
