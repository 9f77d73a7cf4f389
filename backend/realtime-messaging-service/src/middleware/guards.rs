//! Request guards for the plain HTTP routes.

use crate::error::AppError;
use crate::services::Principal;
use crate::state::AppState;
use actix_web::{http::header, web, Error, FromRequest, HttpRequest};
use std::future::Future;
use std::pin::Pin;

/// A caller authenticated through the same resolver the gateway uses.
#[derive(Debug, Clone)]
pub struct User(pub Principal);

impl FromRequest for User {
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let credential = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Box::pin(async move {
            let state = state.ok_or(AppError::Internal)?;
            let principal = state
                .gateway
                .verifier()
                .resolve(credential.as_deref())
                .await
                .map_err(AppError::from)?;
            Ok(User(principal))
        })
    }
}

/// Extracts the upgrade credential: `auth` query, then `token` query, then
/// the `Authorization` header.
pub fn upgrade_credential(req: &HttpRequest, auth: Option<&str>, token: Option<&str>) -> Option<String> {
    auth.or(token)
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .filter(|c| !c.trim().is_empty())
}

