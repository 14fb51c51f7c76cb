//! Authentication adapter for the relational backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use gearshed_backend::{
    ensure_context, AuthProvider, AuthSession, AuthStateCallback, AuthUser, DecodedIdToken,
    ListenerRegistration, ProfileUpdate, UserRecord,
};
use gearshed_common::{AuthErrorCode, Error, ExecutionContext, Result};
use gearshed_crypto::TokenClaims;

use crate::engine::identity::{AdminSession, IdentityService, IssuedToken};
use crate::BACKEND_NAME;

/// Access tokens are refreshed once less than this much lifetime is left.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Email and password accounts in the project database.
pub struct RelationalAuth {
    context: ExecutionContext,
    identity: Arc<IdentityService>,
    session: AuthSession,
    admin: Option<Arc<AdminSession>>,
}

impl RelationalAuth {
    pub fn client(identity: Arc<IdentityService>) -> Self {
        Self {
            context: ExecutionContext::Client,
            identity,
            session: AuthSession::new(),
            admin: None,
        }
    }

    pub fn server(admin: Arc<AdminSession>, identity: Arc<IdentityService>) -> Self {
        Self {
            context: ExecutionContext::Server,
            identity,
            session: AuthSession::new(),
            admin: Some(admin),
        }
    }

    fn require_client(&self, operation: &'static str) -> Result<()> {
        ensure_context(operation, self.context, ExecutionContext::Client)
    }

    fn require_admin(&self, operation: &'static str) -> Result<&AdminSession> {
        ensure_context(operation, self.context, ExecutionContext::Server)?;
        self.admin
            .as_deref()
            .ok_or_else(|| Error::NotInitialized("service role session".to_string()))
    }

    /// Make `record` the current user and announce it.
    fn start_session(&self, record: UserRecord, issued: IssuedToken) -> AuthUser {
        let user = AuthUser::new(record, issued.token, from_unix(issued.claims.exp));
        self.session.set(Some(user.clone()));
        user
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decoded(claims: TokenClaims) -> DecodedIdToken {
    DecodedIdToken {
        uid: claims.sub,
        email: claims.email,
        email_verified: claims.email_verified,
        issuer: claims.iss,
        issued_at: from_unix(claims.iat),
        expires_at: from_unix(claims.exp),
        auth_time: from_unix(claims.auth_time),
    }
}

#[async_trait]
impl AuthProvider for RelationalAuth {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn context(&self) -> ExecutionContext {
        self.context
    }

    fn on_auth_state_changed(&self, callback: AuthStateCallback) -> Result<ListenerRegistration> {
        self.require_client("on_auth_state_changed")?;
        Ok(self.session.subscribe(callback))
    }

    async fn create_user_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthUser> {
        self.require_client("create_user_with_email_and_password")?;
        let (record, issued) = self.identity.sign_up(email, password)?;
        Ok(self.start_session(record, issued))
    }

    async fn sign_in_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthUser> {
        self.require_client("sign_in_with_email_and_password")?;
        let (record, issued) = self.identity.sign_in(email, password)?;
        Ok(self.start_session(record, issued))
    }

    async fn send_email_verification(&self) -> Result<()> {
        self.require_client("send_email_verification")?;
        let token = self.get_id_token(false).await?;
        self.identity.send_verification(&token)
    }

    async fn apply_action_code(&self, code: &str) -> Result<()> {
        self.require_client("apply_action_code")?;
        let record = self.identity.apply_action_code(code)?;
        match self.session.current() {
            Some(current) if current.uid == record.uid => {
                let token = current.id_token().to_string();
                self.session
                    .replace_silently(AuthUser::new(record, token, current.token_expires_at()));
            }
            _ => {}
        }
        Ok(())
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
        self.require_client("update_profile")?;
        let token = self.get_id_token(false).await?;
        let record = self
            .identity
            .update_profile(&token, update.display_name, update.photo_url)?;
        let expires_at = self
            .session
            .current()
            .map(|u| u.token_expires_at())
            .unwrap_or_else(Utc::now);
        self.session
            .set(Some(AuthUser::new(record, token, expires_at)));
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.require_client("sign_out")?;
        if self.session.current().is_some() {
            self.session.set(None);
        }
        Ok(())
    }

    fn current_user(&self) -> Result<Option<AuthUser>> {
        self.require_client("current_user")?;
        Ok(self.session.current())
    }

    async fn get_id_token(&self, force_refresh: bool) -> Result<String> {
        self.require_client("get_id_token")?;
        let current = self.session.current().ok_or_else(|| {
            Error::auth(AuthErrorCode::NoCurrentUser, "No user is signed in")
        })?;
        let fresh_until = current.token_expires_at() - ChronoDuration::seconds(REFRESH_MARGIN_SECS);
        if !force_refresh && Utc::now() < fresh_until {
            return Ok(current.id_token().to_string());
        }

        match self.identity.refresh(current.id_token()) {
            Ok((record, issued)) => {
                debug!(uid = %record.uid, "Refreshed access token");
                let token = issued.token.clone();
                self.session.replace_silently(AuthUser::new(
                    record,
                    issued.token,
                    from_unix(issued.claims.exp),
                ));
                Ok(token)
            }
            Err(e) => {
                if matches!(
                    e.auth_code(),
                    Some(AuthErrorCode::IdTokenRevoked | AuthErrorCode::UserNotFound)
                ) {
                    warn!(uid = %current.uid, error = %e, "Session ended by the server");
                    self.session.set(None);
                }
                Err(e)
            }
        }
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<DecodedIdToken> {
        let admin = self.require_admin("verify_id_token")?;
        Ok(decoded(admin.identity().verify_token(id_token)?))
    }

    async fn create_session_cookie(&self, id_token: &str, expires_in: Duration) -> Result<String> {
        self.require_admin("create_session_cookie")?
            .create_session_cookie(id_token, expires_in)
    }

    async fn verify_session_cookie(
        &self,
        cookie: &str,
        check_revoked: bool,
    ) -> Result<DecodedIdToken> {
        let admin = self.require_admin("verify_session_cookie")?;
        Ok(decoded(admin.verify_session_cookie(cookie, check_revoked)?))
    }

    async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()> {
        self.require_admin("revoke_refresh_tokens")?
            .identity()
            .revoke(uid)
    }
}
