//! Authentication capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gearshed_common::{ExecutionContext, Result};

use crate::subscription::{register, ListenerRegistration, ListenerSet};

/// Account data of a user, without any credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

/// A signed-in user as seen by client code.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    id_token: String,
    token_expires_at: DateTime<Utc>,
}

impl AuthUser {
    pub fn new(record: UserRecord, id_token: String, token_expires_at: DateTime<Utc>) -> Self {
        Self {
            uid: record.uid,
            email: record.email,
            email_verified: record.email_verified,
            display_name: record.display_name,
            photo_url: record.photo_url,
            id_token,
            token_expires_at,
        }
    }

    /// The id token issued with this sign-in or its last refresh.
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        self.token_expires_at
    }

    pub fn record(&self) -> UserRecord {
        UserRecord {
            uid: self.uid.clone(),
            email: self.email.clone(),
            email_verified: self.email_verified,
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
        }
    }
}

impl fmt::Debug for AuthUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthUser")
            .field("uid", &self.uid)
            .field("email", &self.email)
            .field("email_verified", &self.email_verified)
            .field("display_name", &self.display_name)
            .field("photo_url", &self.photo_url)
            .field("id_token", &"[REDACTED]")
            .finish()
    }
}

/// Profile fields to change; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

/// Claims of a verified id token or session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedIdToken {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub auth_time: DateTime<Utc>,
}

/// Receives the current user on every auth state change.
pub type AuthStateCallback = Box<dyn Fn(Option<AuthUser>) + Send + Sync>;

/// Authentication operations.
///
/// Client-context adapters implement the sign-in flow; server-context
/// adapters implement token and session verification. Calling a method from
/// the other context returns `ContextViolation`.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn backend(&self) -> &'static str;

    fn context(&self) -> ExecutionContext;

    /// Watch the signed-in user. The callback receives the current user
    /// first. Client only.
    fn on_auth_state_changed(&self, callback: AuthStateCallback) -> Result<ListenerRegistration>;

    /// Create an account and sign it in. Client only.
    async fn create_user_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthUser>;

    /// Client only.
    async fn sign_in_with_email_and_password(&self, email: &str, password: &str)
        -> Result<AuthUser>;

    /// Send a verification code to the current user's email. Client only.
    async fn send_email_verification(&self) -> Result<()>;

    /// Apply an emailed action code. Client only.
    async fn apply_action_code(&self, code: &str) -> Result<()>;

    /// Change the current user's profile. Client only.
    async fn update_profile(&self, update: ProfileUpdate) -> Result<()>;

    /// Client only.
    async fn sign_out(&self) -> Result<()>;

    /// The signed-in user, or `None` when signed out. Client only.
    fn current_user(&self) -> Result<Option<AuthUser>>;

    /// The current user's id token, refreshed if expired or forced. Client only.
    async fn get_id_token(&self, force_refresh: bool) -> Result<String>;

    /// Server only.
    async fn verify_id_token(&self, id_token: &str) -> Result<DecodedIdToken>;

    /// Exchange an id token for a session cookie. Server only.
    ///
    /// # Errors
    /// - `auth/invalid-session-cookie-duration` outside 5 minutes to 14 days
    async fn create_session_cookie(&self, id_token: &str, expires_in: Duration) -> Result<String>;

    /// Server only.
    async fn verify_session_cookie(
        &self,
        cookie: &str,
        check_revoked: bool,
    ) -> Result<DecodedIdToken>;

    /// Invalidate every session of `uid` issued so far. Server only.
    async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()>;
}

type AuthListener = dyn Fn(Option<AuthUser>) + Send + Sync;

/// Signed-in state of a client adapter and its listeners.
pub struct AuthSession {
    current: RwLock<Option<AuthUser>>,
    listeners: Arc<ListenerSet<AuthListener>>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            listeners: Arc::new(ListenerSet::new()),
        }
    }

    pub fn current(&self) -> Option<AuthUser> {
        self.current.read().clone()
    }

    /// Replace the current user and notify every listener.
    pub fn set(&self, user: Option<AuthUser>) {
        *self.current.write() = user.clone();
        for (_, listener) in self.listeners.snapshot() {
            listener(user.clone());
        }
    }

    /// Replace the current user without notifying, e.g. on token refresh.
    pub fn replace_silently(&self, user: AuthUser) {
        *self.current.write() = Some(user);
    }

    pub fn subscribe(&self, callback: AuthStateCallback) -> ListenerRegistration {
        let listener: Arc<AuthListener> = Arc::from(callback);
        let (_, registration) = register(&self.listeners, Arc::clone(&listener));
        listener(self.current());
        registration
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn user(uid: &str) -> AuthUser {
        AuthUser::new(
            UserRecord {
                uid: uid.to_string(),
                email: Some(format!("{}@example.com", uid)),
                email_verified: false,
                display_name: None,
                photo_url: None,
            },
            "token".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn test_session_notifies_listeners() {
        let session = AuthSession::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let registration = session.subscribe(Box::new(move |u: Option<AuthUser>| {
            sink.lock().push(u.map(|u| u.uid));
        }));

        session.set(Some(user("u1")));
        session.set(None);
        registration.unsubscribe();
        session.set(Some(user("u2")));

        assert_eq!(
            *seen.lock(),
            vec![None, Some("u1".to_string()), None]
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", user("u1"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("\"token\""));
    }
}
