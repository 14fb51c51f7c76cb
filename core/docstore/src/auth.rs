//! Authentication adapter for the document store.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use gearshed_backend::{
    ensure_context, AuthProvider, AuthSession, AuthStateCallback, AuthUser, DecodedIdToken,
    ListenerRegistration, ProfileUpdate, UserRecord,
};
use gearshed_common::{AuthErrorCode, Error, ExecutionContext, Result};
use gearshed_crypto::TokenClaims;

use crate::engine::identity::{AdminSession, IdentityService, IssuedToken};
use crate::BACKEND_NAME;

/// Refresh id tokens this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Email and password authentication against a project's identity service.
///
/// A client adapter keeps the signed-in user; a server adapter verifies
/// tokens and session cookies through an admin session.
pub struct DocstoreAuth {
    context: ExecutionContext,
    identity: Arc<IdentityService>,
    session: AuthSession,
    admin: Option<Arc<AdminSession>>,
}

impl DocstoreAuth {
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

    fn client_only(&self, operation: &'static str) -> Result<()> {
        ensure_context(operation, self.context, ExecutionContext::Client)
    }

    fn admin(&self, operation: &'static str) -> Result<&AdminSession> {
        ensure_context(operation, self.context, ExecutionContext::Server)?;
        self.admin
            .as_deref()
            .ok_or_else(|| Error::NotInitialized("admin session".to_string()))
    }

    fn signed_in(&self) -> Result<AuthUser> {
        self.session.current().ok_or_else(|| {
            Error::auth(AuthErrorCode::NoCurrentUser, "No user is signed in")
        })
    }

    fn user(record: UserRecord, issued: IssuedToken) -> AuthUser {
        AuthUser::new(record, issued.token, unix_time(issued.claims.exp))
    }
}

fn unix_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decoded(claims: TokenClaims) -> DecodedIdToken {
    DecodedIdToken {
        uid: claims.sub,
        email: claims.email,
        email_verified: claims.email_verified,
        issuer: claims.iss,
        issued_at: unix_time(claims.iat),
        expires_at: unix_time(claims.exp),
        auth_time: unix_time(claims.auth_time),
    }
}

#[async_trait]
impl AuthProvider for DocstoreAuth {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn context(&self) -> ExecutionContext {
        self.context
    }

    fn on_auth_state_changed(&self, callback: AuthStateCallback) -> Result<ListenerRegistration> {
        self.client_only("on_auth_state_changed")?;
        Ok(self.session.subscribe(callback))
    }

    async fn create_user_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthUser> {
        self.client_only("create_user_with_email_and_password")?;
        let (record, issued) = self.identity.sign_up(email, password)?;
        let user = Self::user(record, issued);
        self.session.set(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthUser> {
        self.client_only("sign_in_with_email_and_password")?;
        let (record, issued) = self.identity.sign_in(email, password)?;
        let user = Self::user(record, issued);
        self.session.set(Some(user.clone()));
        Ok(user)
    }

    async fn send_email_verification(&self) -> Result<()> {
        self.client_only("send_email_verification")?;
        let token = self.get_id_token(false).await?;
        self.identity.send_verification(&token)
    }

    async fn apply_action_code(&self, code: &str) -> Result<()> {
        self.client_only("apply_action_code")?;
        let record = self.identity.apply_action_code(code)?;

        if let Some(current) = self.session.current() {
            if current.uid == record.uid {
                let token = current.id_token().to_string();
                let expires_at = current.token_expires_at();
                self.session
                    .replace_silently(AuthUser::new(record, token, expires_at));
            }
        }
        Ok(())
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
        self.client_only("update_profile")?;
        let token = self.get_id_token(false).await?;
        let record = self
            .identity
            .update_profile(&token, update.display_name, update.photo_url)?;
        let current = self.signed_in()?;
        self.session.set(Some(AuthUser::new(
            record,
            current.id_token().to_string(),
            current.token_expires_at(),
        )));
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.client_only("sign_out")?;
        if self.session.current().is_some() {
            self.session.set(None);
        }
        Ok(())
    }

    fn current_user(&self) -> Result<Option<AuthUser>> {
        self.client_only("current_user")?;
        Ok(self.session.current())
    }

    async fn get_id_token(&self, force_refresh: bool) -> Result<String> {
        self.client_only("get_id_token")?;
        let current = self.signed_in()?;

        let refresh_at = current.token_expires_at() - ChronoDuration::seconds(REFRESH_MARGIN_SECS);
        if !force_refresh && Utc::now() < refresh_at {
            return Ok(current.id_token().to_string());
        }

        let (record, issued) = match self.identity.refresh(current.id_token()) {
            Ok(refreshed) => refreshed,
            Err(e) => {
                if e.auth_code() == Some(AuthErrorCode::IdTokenRevoked)
                    || e.auth_code() == Some(AuthErrorCode::UserNotFound)
                {
                    self.session.set(None);
                }
                return Err(e);
            }
        };
        debug!(uid = %record.uid, "Refreshed id token");
        let user = Self::user(record, issued);
        let token = user.id_token().to_string();
        self.session.replace_silently(user);
        Ok(token)
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<DecodedIdToken> {
        let admin = self.admin("verify_id_token")?;
        Ok(decoded(admin.identity().verify_id_token(id_token)?))
    }

    async fn create_session_cookie(&self, id_token: &str, expires_in: Duration) -> Result<String> {
        self.admin("create_session_cookie")?
            .create_session_cookie(id_token, expires_in)
    }

    async fn verify_session_cookie(
        &self,
        cookie: &str,
        check_revoked: bool,
    ) -> Result<DecodedIdToken> {
        let admin = self.admin("verify_session_cookie")?;
        Ok(decoded(admin.verify_session_cookie(cookie, check_revoked)?))
    }

    async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()> {
        self.admin("revoke_refresh_tokens")?
            .identity()
            .revoke(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_common::SecretString;
    use parking_lot::Mutex;

    fn pair() -> (DocstoreAuth, DocstoreAuth) {
        let identity = Arc::new(IdentityService::new("garage"));
        let admin = Arc::new(
            AdminSession::new(Arc::clone(&identity), &SecretString::new("service-key"), None)
                .unwrap(),
        );
        (
            DocstoreAuth::client(Arc::clone(&identity)),
            DocstoreAuth::server(admin, identity),
        )
    }

    #[tokio::test]
    async fn test_sign_up_notifies_and_sign_out_clears() {
        let (client, _) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registration = client
            .on_auth_state_changed(Box::new(move |u: Option<AuthUser>| {
                sink.lock().push(u.map(|u| u.email.unwrap_or_default()));
            }))
            .unwrap();

        client
            .create_user_with_email_and_password("rider@example.com", "chainring")
            .await
            .unwrap();
        assert!(client.current_user().unwrap().is_some());
        client.sign_out().await.unwrap();
        assert!(client.current_user().unwrap().is_none());
        registration.unsubscribe();

        assert_eq!(
            *seen.lock(),
            vec![None, Some("rider@example.com".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_server_verifies_client_token() {
        let (client, server) = pair();
        let user = client
            .create_user_with_email_and_password("rider@example.com", "chainring")
            .await
            .unwrap();

        let token = client.get_id_token(false).await.unwrap();
        assert_eq!(token, user.id_token());
        let decoded = server.verify_id_token(&token).await.unwrap();
        assert_eq!(decoded.uid, user.uid);
        assert_eq!(decoded.issuer, "garage");

        let forced = client.get_id_token(true).await.unwrap();
        assert_eq!(server.verify_id_token(&forced).await.unwrap().uid, user.uid);
    }

    #[tokio::test]
    async fn test_profile_and_verification() {
        let (client, _) = pair();
        client
            .create_user_with_email_and_password("rider@example.com", "chainring")
            .await
            .unwrap();

        client
            .update_profile(ProfileUpdate {
                display_name: Some("Rider".to_string()),
                photo_url: None,
            })
            .await
            .unwrap();
        assert_eq!(
            client.current_user().unwrap().unwrap().display_name.as_deref(),
            Some("Rider")
        );

        client.send_email_verification().await.unwrap();
        let code = client.identity.outbox().pop().unwrap().code;
        client.apply_action_code(&code).await.unwrap();
        assert!(client.current_user().unwrap().unwrap().email_verified);
    }

    #[tokio::test]
    async fn test_context_guards() {
        let (client, server) = pair();

        for err in [
            client.verify_id_token("t").await.unwrap_err(),
            client
                .create_session_cookie("t", Duration::from_secs(600))
                .await
                .unwrap_err(),
            client.verify_session_cookie("c", true).await.unwrap_err(),
            client.revoke_refresh_tokens("u").await.unwrap_err(),
            server
                .create_user_with_email_and_password("a@example.com", "chainring")
                .await
                .unwrap_err(),
            server
                .sign_in_with_email_and_password("a@example.com", "chainring")
                .await
                .unwrap_err(),
            server.send_email_verification().await.unwrap_err(),
            server.apply_action_code("code").await.unwrap_err(),
            server.update_profile(ProfileUpdate::default()).await.unwrap_err(),
            server.sign_out().await.unwrap_err(),
            server.get_id_token(false).await.unwrap_err(),
            server.on_auth_state_changed(Box::new(|_| {})).unwrap_err(),
            server.current_user().unwrap_err(),
        ] {
            assert!(err.is_context_violation(), "{}", err);
        }
    }

    #[tokio::test]
    async fn test_no_current_user() {
        let (client, _) = pair();
        let err = client.get_id_token(false).await.unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::NoCurrentUser));
    }
}
