//! Request identity.
//!
//! A request is authenticated by an opaque session token, taken from the
//! `crm_session` cookie or an `Authorization: Bearer` header. Handlers ask
//! for [`Tenant`] (an active organization user) or [`SuperAdmin`] as an
//! extractor; tenant data access is then scoped by
//! [`Tenant::organization_id`].

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::cookie::CookieJar;
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use super::api::{ApiError, SharedState};
use super::models::{Organization, Role, User};
use crate::errors::CrmError;

pub const SESSION_COOKIE: &str = "crm_session";

/// Pull the session token out of the request, cookie first.
fn session_token(parts: &Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let value = cookie.value().trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    parts
        .headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

async fn authenticate(parts: &Parts, state: &SharedState) -> Result<User, ApiError> {
    let token = session_token(parts).ok_or(CrmError::Unauthorized)?;
    let user = state
        .db
        .call(move |db| db.resolve_session(&token))
        .await?
        .ok_or(CrmError::Unauthorized)?;
    if !user.active {
        return Err(CrmError::Forbidden("user is inactive".into()).into());
    }
    Ok(user)
}

/// An active user acting inside their organization.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub user: User,
    pub organization: Organization,
}

impl Tenant {
    pub fn organization_id(&self) -> i64 {
        self.organization.id
    }

    pub fn is_admin(&self) -> bool {
        self.user.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), CrmError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(CrmError::Forbidden("organization admin role required".into()))
        }
    }
}

impl FromRequestParts<SharedState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let user = authenticate(parts, state).await?;
        let org_id = user
            .organization_id
            .ok_or_else(|| CrmError::Forbidden("user has no organization".into()))?;
        let organization = state.db.call(move |db| db.get_organization(org_id)).await?;
        if !organization.active {
            return Err(CrmError::Forbidden("organization is inactive".into()).into());
        }
        Ok(Tenant { user, organization })
    }
}

/// A platform operator managing plans, organizations and users.
#[derive(Debug, Clone)]
pub struct SuperAdmin(pub User);

impl FromRequestParts<SharedState> for SuperAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let user = authenticate(parts, state).await?;
        if user.role != Role::Superadmin {
            return Err(CrmError::Forbidden("superadmin role required".into()).into());
        }
        Ok(SuperAdmin(user))
    }
}
