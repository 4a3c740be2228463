use actix_web::{http::StatusCode, web, HttpResponse, ResponseError};
use mongodb::error::{ErrorKind, WriteFailure};
use log::error;
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Payment provider error: {0}")]
    Payment(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError::BadRequest(msg.into())
    }

    pub fn not_found(what: &str) -> Self {
        AppError::NotFound(format!("{what} not found"))
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }

    /// Message sent to clients. Server-side failures are masked.
    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "Something went wrong".to_string(),
            other => other.to_string(),
        }
    }
}

const DUPLICATE_KEY: i32 = 11000;

/// Server message of a unique-index violation. It names the index that was hit.
pub fn duplicate_key_message(err: &mongodb::error::Error) -> Option<&str> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY => Some(&e.message),
        ErrorKind::Command(e) if e.code == DUPLICATE_KEY => Some(&e.message),
        _ => None,
    }
}

/// True when a write was rejected by a unique index.
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    duplicate_key_message(err).is_some()
}

// Extractor failures (bad JSON, query or path) use the same error body as handlers.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _| AppError::bad_request(err.to_string()).into())
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _| AppError::bad_request(err.to_string()).into())
}

pub fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err, _| AppError::bad_request(err.to_string()).into())
}

impl From<bson::ser::Error> for AppError {
    fn from(e: bson::ser::Error) -> Self {
        AppError::Internal(format!("bson serialization: {e}"))
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(e: bcrypt::BcryptError) -> Self {
        AppError::Internal(format!("bcrypt: {e}"))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        AppError::Unauthorized("Invalid or expired token".to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Payment(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(e) if is_duplicate_key(e) => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let label = if status.is_server_error() {
            error!("{}", self);
            "error"
        } else {
            "fail"
        };
        let message = if status == StatusCode::CONFLICT && matches!(self, AppError::Database(_)) {
            "Duplicate value".to_string()
        } else {
            self.public_message()
        };

        HttpResponse::build(status).json(json!({ "status": label, "message": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::{test as actix_test, App};
    use mongodb::bson::{doc, from_document};
    use mongodb::error::WriteError;
    use serde::Deserialize;

    fn duplicate_email_error() -> mongodb::error::Error {
        let write_error: WriteError = from_document(doc! {
            "code": 11000,
            "codeName": "DuplicateKey",
            "errmsg": "E11000 duplicate key error collection: talenthive.users index: email_1 dup key: { email: \"jane@example.com\" }",
        })
        .unwrap();
        mongodb::error::Error::from(ErrorKind::Write(WriteFailure::WriteError(write_error)))
    }

    #[actix_web::test]
    async fn client_errors_render_as_fail() {
        let resp = AppError::conflict("Email already registered").error_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "fail");
        assert_eq!(value["message"], "Email already registered");
    }

    #[actix_web::test]
    async fn internal_errors_hide_details() {
        let resp = AppError::Internal("db password leaked here".into()).error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "Something went wrong");
    }

    #[test]
    fn status_codes() {
        assert_eq!(AppError::bad_request("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::not_found("Project").to_string(), "Project not found");
        assert_eq!(AppError::forbidden("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Payment("x".into()).status_code(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn duplicate_key_renders_as_conflict() {
        let err = duplicate_email_error();
        assert!(is_duplicate_key(&err));
        assert!(duplicate_key_message(&err).unwrap().contains("email_1"));

        let resp = AppError::from(err).error_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "fail");
        assert_eq!(value["message"], "Duplicate value");
    }

    #[test]
    fn other_write_errors_are_not_duplicates() {
        let write_error: WriteError =
            from_document(doc! { "code": 121, "errmsg": "Document failed validation" }).unwrap();
        let err = mongodb::error::Error::from(ErrorKind::Write(WriteFailure::WriteError(write_error)));
        assert!(!is_duplicate_key(&err));
        assert_eq!(AppError::from(err).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[derive(Deserialize)]
    struct Paging {
        #[allow(dead_code)]
        page: u64,
    }

    async fn echo(body: web::Json<serde_json::Value>) -> HttpResponse {
        HttpResponse::Ok().json(body.into_inner())
    }

    async fn paged(_: web::Query<Paging>) -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    async fn numbered(_: web::Path<u32>) -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn extractor_errors_use_json_body() {
        let app = actix_test::init_service(
            App::new()
                .app_data(json_config())
                .app_data(query_config())
                .app_data(path_config())
                .route("/echo", web::post().to(echo))
                .route("/paged", web::get().to(paged))
                .route("/items/{n}", web::get().to(numbered)),
        )
        .await;

        let requests = [
            actix_test::TestRequest::post()
                .uri("/echo")
                .insert_header(("content-type", "application/json"))
                .set_payload("{not json")
                .to_request(),
            actix_test::TestRequest::get().uri("/paged?page=abc").to_request(),
            actix_test::TestRequest::get().uri("/items/seven").to_request(),
        ];
        for req in requests {
            let resp = actix_test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            let value: serde_json::Value = actix_test::read_body_json(resp).await;
            assert_eq!(value["status"], "fail");
            assert!(value["message"].as_str().is_some_and(|m| !m.is_empty()));
        }
    }
}
