//! axum responses for business errors and envelopes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::{translate, BusinessError, ResponseData};
use crate::error::Error;

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl IntoResponse for BusinessError {
    fn into_response(self) -> Response {
        (status(self.status()), Json(ResponseData::from_business(&self))).into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (code, body) = translate(&self);
        (status(code), Json(body)).into_response()
    }
}

impl<T: Serialize> IntoResponse for ResponseData<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
