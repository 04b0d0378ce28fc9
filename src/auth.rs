use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{FromRequest, Outcome as RequestOutcome, Request};
use serde::{Deserialize, Serialize};

use crate::config::EventsConfig;
use crate::errors::{AppError, AppResult};
use crate::models::Identity;

/// Scope guarding fleet-wide operations such as publishing events.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Create,
}

impl Access {
    fn as_str(self) -> &'static str {
        match self {
            Access::Create => "create",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Grants in `scope:access` form, e.g. `global:create`.
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: usize,
}

#[derive(Debug)]
pub struct AuthUser {
    pub identity: Identity,
    admin: bool,
    grants: Vec<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = AppError;
    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let Some(bearer) = req.headers().get_one("Authorization").and_then(|h| h.strip_prefix("Bearer ")) else {
            return Outcome::Error((Status::Unauthorized, AppError::Unauthorized));
        };
        let secret = match req.rocket().state::<EventsConfig>() {
            Some(cfg) => cfg.jwt_secret.clone(),
            None => std::env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".into()),
        };
        match AuthUser::from_token(bearer, &secret) {
            Ok(user) => Outcome::Success(user),
            Err(_) => Outcome::Error((Status::Unauthorized, AppError::Unauthorized)),
        }
    }
}

/// An `AuthUser` holding create access on the global scope. Checked before
/// the request body is read, so an unauthorized caller gets 403 whatever it sent.
#[derive(Debug)]
pub struct Publisher(pub AuthUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Publisher {
    type Error = AppError;
    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let user = rocket::outcome::try_outcome!(req.guard::<AuthUser>().await);
        match user.require(GLOBAL_SCOPE, Access::Create) {
            Ok(()) => Outcome::Success(Publisher(user)),
            Err(e) => Outcome::Error((Status::Forbidden, e)),
        }
    }
}

impl AuthUser {
    pub fn from_token(token: &str, secret: &str) -> AppResult<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)?;
        let claims = data.claims;
        Ok(AuthUser {
            identity: Identity::new(claims.sub).with_groups(claims.groups),
            admin: matches!(claims.role.as_str(), "admin" | "Admin"),
            grants: claims.scopes,
        })
    }

    pub fn can(&self, scope: &str, access: Access) -> bool {
        if self.admin {
            return true;
        }
        let wanted = format!("{}:{}", scope, access.as_str());
        self.grants.iter().any(|g| *g == wanted)
    }

    pub fn require(&self, scope: &str, access: Access) -> AppResult<()> {
        if !self.can(scope, access) {
            return Err(AppError::Forbidden);
        }
        Ok(())
    }
}
