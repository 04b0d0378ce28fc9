use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{Responder, Response};
use rocket::serde::json::json;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
	#[error("not found")]
	NotFound,
	#[error("unauthorized")]
	Unauthorized,
	#[error("forbidden")]
	Forbidden,
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("service unavailable: {0}")]
	Unavailable(String),
	#[error(transparent)]
	Broker(#[from] redis::RedisError),
	#[error(transparent)]
	Jwt(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error("unprocessable request: {0}")]
	Unprocessable(String),
}

impl AppError {
	pub fn status(&self) -> Status {
		match self {
			AppError::NotFound => Status::NotFound,
			AppError::Unauthorized => Status::Unauthorized,
			AppError::Forbidden => Status::Forbidden,
			AppError::BadRequest(_) => Status::BadRequest,
			AppError::Unavailable(_) => Status::ServiceUnavailable,
			AppError::Broker(_) => Status::ServiceUnavailable,
			AppError::Jwt(_) => Status::Unauthorized,
			AppError::Json(_) => Status::BadRequest,
			AppError::Unprocessable(_) => Status::UnprocessableEntity,
		}
	}
}

impl<'r> Responder<'r, 'static> for AppError {
	fn respond_to(self, _req: &'r Request<'_>) -> Result<Response<'static>, Status> {
		let status = self.status();
		let body = json!({
			"error": self.to_string(),
			"code": status.code,
		});
		Response::build()
			.status(status)
			.sized_body(None, Cursor::new(body.to_string()))
			.header(rocket::http::ContentType::JSON)
			.ok()
	}
}

pub type AppResult<T> = Result<T, AppError>;

// Guard and body-parsing failures never reach a handler; these keep their
// responses in the same JSON shape as handler errors.

#[catch(400)]
fn bad_request() -> AppError {
	AppError::BadRequest("malformed request".into())
}

#[catch(401)]
fn unauthorized() -> AppError {
	AppError::Unauthorized
}

#[catch(403)]
fn forbidden() -> AppError {
	AppError::Forbidden
}

#[catch(404)]
fn not_found() -> AppError {
	AppError::NotFound
}

#[catch(422)]
fn unprocessable() -> AppError {
	AppError::Unprocessable("request body does not match the expected shape".into())
}

pub fn catchers() -> Vec<rocket::Catcher> {
	catchers![bad_request, unauthorized, forbidden, not_found, unprocessable]
}
