//! Accounts, id tokens and admin sessions of one project.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use gearshed_backend::{auto_id, UserRecord};
use gearshed_common::{AuthErrorCode, Error, Result, SecretString};
use gearshed_crypto::{
    hash_password, validate_cookie_lifetime, validate_password, verify_password, CookieSealer,
    SigningKey, TokenClaims, TokenSigner, ID_TOKEN_LIFETIME_SECS,
};

/// Lifetime of an emailed action code.
pub const ACTION_CODE_LIFETIME_SECS: i64 = 3 * 24 * 60 * 60;

const SESSION_KEY_PURPOSE: &[u8] = b"gearshed-docstore-session-cookie";

/// An issued id token and its claims.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

/// What an action code does when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    VerifyEmail,
}

/// A message the identity service would have emailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub to: String,
    pub kind: ActionKind,
    pub code: String,
}

#[derive(Debug, Clone)]
struct Account {
    record: UserRecord,
    password_hash: String,
    /// Sessions that started before this time are revoked.
    valid_since: i64,
}

#[derive(Debug, Clone)]
struct PendingCode {
    uid: String,
    kind: ActionKind,
    expires_at: i64,
}

#[derive(Default)]
struct Accounts {
    by_uid: HashMap<String, Account>,
    uid_by_email: HashMap<String, String>,
    codes: HashMap<String, PendingCode>,
    outbox: Vec<OutboxMessage>,
}

/// Email and password identities of one project.
pub struct IdentityService {
    signer: TokenSigner,
    accounts: Mutex<Accounts>,
}

impl IdentityService {
    pub fn new(project_id: &str) -> Self {
        Self {
            signer: TokenSigner::new(SigningKey::generate(), project_id),
            accounts: Mutex::new(Accounts::default()),
        }
    }

    pub fn project_id(&self) -> &str {
        self.signer.issuer()
    }

    /// Create an account and issue its first id token.
    ///
    /// # Errors
    /// - `auth/invalid-email`, `auth/weak-password`
    /// - `auth/email-already-in-use`
    pub fn sign_up(&self, email: &str, password: &str) -> Result<(UserRecord, IssuedToken)> {
        let email = normalize_email(email)?;
        validate_password(password)?;
        let password_hash = hash_password(password)?;

        let mut accounts = self.accounts.lock();
        if accounts.uid_by_email.contains_key(&email) {
            return Err(Error::auth(
                AuthErrorCode::EmailAlreadyInUse,
                "The email address is already in use by another account",
            ));
        }

        let uid = auto_id();
        let record = UserRecord {
            uid: uid.clone(),
            email: Some(email.clone()),
            email_verified: false,
            display_name: None,
            photo_url: None,
        };
        accounts.uid_by_email.insert(email, uid.clone());
        accounts.by_uid.insert(
            uid.clone(),
            Account {
                record: record.clone(),
                password_hash,
                valid_since: 0,
            },
        );
        drop(accounts);

        info!(uid = %uid, "Created account");
        let issued = self.issue(&record, now_secs())?;
        Ok((record, issued))
    }

    /// Check a password and issue an id token.
    ///
    /// # Errors
    /// - `auth/invalid-credential` for an unknown email or a wrong password
    pub fn sign_in(&self, email: &str, password: &str) -> Result<(UserRecord, IssuedToken)> {
        let email = normalize_email(email)?;
        let rejected = || {
            Error::auth(
                AuthErrorCode::InvalidCredential,
                "The email or password is incorrect",
            )
        };

        let account = {
            let accounts = self.accounts.lock();
            let uid = accounts.uid_by_email.get(&email).ok_or_else(rejected)?;
            accounts.by_uid.get(uid).cloned().ok_or_else(rejected)?
        };

        if !verify_password(password, &account.password_hash)? {
            return Err(rejected());
        }

        // A sign-in in the second of a revocation must stay valid.
        let auth_time = now_secs().max(account.valid_since);
        let issued = self.issue(&account.record, auth_time)?;
        debug!(uid = %account.record.uid, "Signed in");
        Ok((account.record, issued))
    }

    /// Issue a fresh token for the session `id_token` belongs to. The old
    /// token may have expired.
    ///
    /// # Errors
    /// - `auth/argument-error` for a token not issued here
    /// - `auth/user-not-found`, `auth/id-token-revoked`
    pub fn refresh(&self, id_token: &str) -> Result<(UserRecord, IssuedToken)> {
        let claims = self.signer.verify(id_token, i64::MIN)?;
        let account = self.account(&claims.sub)?;
        if claims.auth_time < account.valid_since {
            return Err(Error::auth(
                AuthErrorCode::IdTokenRevoked,
                "The session has been revoked",
            ));
        }
        let issued = self.issue(&account.record, claims.auth_time)?;
        Ok((account.record, issued))
    }

    /// # Errors
    /// - `auth/argument-error` when malformed, tampered or foreign
    /// - `auth/id-token-expired`
    pub fn verify_id_token(&self, id_token: &str) -> Result<TokenClaims> {
        self.signer.verify(id_token, now_secs())
    }

    /// Whether the session behind `claims` was revoked.
    ///
    /// # Errors
    /// - `auth/user-not-found` when the account is gone
    pub fn is_revoked(&self, claims: &TokenClaims) -> Result<bool> {
        Ok(claims.auth_time < self.account(&claims.sub)?.valid_since)
    }

    pub fn lookup(&self, uid: &str) -> Option<UserRecord> {
        self.accounts.lock().by_uid.get(uid).map(|a| a.record.clone())
    }

    /// Change the profile of the user `id_token` belongs to.
    pub fn update_profile(
        &self,
        id_token: &str,
        display_name: Option<String>,
        photo_url: Option<String>,
    ) -> Result<UserRecord> {
        let claims = self.verify_id_token(id_token)?;
        let mut accounts = self.accounts.lock();
        let account = accounts
            .by_uid
            .get_mut(&claims.sub)
            .ok_or_else(user_not_found)?;
        if display_name.is_some() {
            account.record.display_name = display_name;
        }
        if photo_url.is_some() {
            account.record.photo_url = photo_url;
        }
        Ok(account.record.clone())
    }

    /// Queue a verification code for the email of the user `id_token`
    /// belongs to.
    pub fn send_verification(&self, id_token: &str) -> Result<()> {
        let claims = self.verify_id_token(id_token)?;
        let mut accounts = self.accounts.lock();
        let email = accounts
            .by_uid
            .get(&claims.sub)
            .ok_or_else(user_not_found)?
            .record
            .email
            .clone()
            .ok_or_else(|| Error::InvalidInput("Account has no email address".to_string()))?;

        let code = auto_id();
        accounts.codes.insert(
            code.clone(),
            PendingCode {
                uid: claims.sub.clone(),
                kind: ActionKind::VerifyEmail,
                expires_at: now_secs() + ACTION_CODE_LIFETIME_SECS,
            },
        );
        accounts.outbox.push(OutboxMessage {
            to: email,
            kind: ActionKind::VerifyEmail,
            code,
        });
        debug!(uid = %claims.sub, "Queued verification email");
        Ok(())
    }

    /// Apply an action code once.
    ///
    /// # Errors
    /// - `auth/invalid-action-code` when unknown, used or expired
    pub fn apply_action_code(&self, code: &str) -> Result<UserRecord> {
        let invalid = || {
            Error::auth(
                AuthErrorCode::InvalidActionCode,
                "The action code is invalid, expired or already used",
            )
        };

        let mut accounts = self.accounts.lock();
        let pending = accounts.codes.remove(code).ok_or_else(invalid)?;
        if pending.expires_at <= now_secs() {
            return Err(invalid());
        }

        let account = accounts
            .by_uid
            .get_mut(&pending.uid)
            .ok_or_else(user_not_found)?;
        match pending.kind {
            ActionKind::VerifyEmail => account.record.email_verified = true,
        }
        Ok(account.record.clone())
    }

    /// Revoke every session of `uid` started so far.
    pub fn revoke(&self, uid: &str) -> Result<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts.by_uid.get_mut(uid).ok_or_else(user_not_found)?;
        // Sessions started in the current second are revoked as well.
        account.valid_since = now_secs() + 1;
        info!(uid = %uid, "Revoked sessions");
        Ok(())
    }

    /// Messages queued so far, oldest first.
    pub fn outbox(&self) -> Vec<OutboxMessage> {
        self.accounts.lock().outbox.clone()
    }

    fn account(&self, uid: &str) -> Result<Account> {
        self.accounts
            .lock()
            .by_uid
            .get(uid)
            .cloned()
            .ok_or_else(user_not_found)
    }

    fn issue(&self, record: &UserRecord, auth_time: i64) -> Result<IssuedToken> {
        let now = now_secs();
        let claims = TokenClaims {
            iss: self.signer.issuer().to_string(),
            sub: record.uid.clone(),
            email: record.email.clone(),
            email_verified: record.email_verified,
            iat: now,
            exp: now + ID_TOKEN_LIFETIME_SECS,
            auth_time,
        };
        Ok(IssuedToken {
            token: self.signer.mint(&claims)?,
            claims,
        })
    }
}

/// Privileged access to an identity service through a service account.
pub struct AdminSession {
    identity: Arc<IdentityService>,
    sealer: CookieSealer,
    client_email: Option<String>,
}

impl AdminSession {
    /// # Errors
    /// - `Crypto` for an empty service account key
    pub fn new(
        identity: Arc<IdentityService>,
        service_account_key: &SecretString,
        client_email: Option<String>,
    ) -> Result<Self> {
        let key = SigningKey::from_secret(service_account_key.expose(), SESSION_KEY_PURPOSE)?;
        Ok(Self {
            identity,
            sealer: CookieSealer::new(key),
            client_email,
        })
    }

    pub fn client_email(&self) -> Option<&str> {
        self.client_email.as_deref()
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    /// Exchange a valid id token for a sealed session cookie.
    ///
    /// # Errors
    /// - `auth/invalid-session-cookie-duration` outside 5 minutes to 14 days
    /// - id token verification errors
    pub fn create_session_cookie(&self, id_token: &str, expires_in: Duration) -> Result<String> {
        validate_cookie_lifetime(expires_in)?;
        let claims = self.identity.verify_id_token(id_token)?;
        if self.identity.is_revoked(&claims)? {
            return Err(Error::auth(
                AuthErrorCode::IdTokenRevoked,
                "The id token has been revoked",
            ));
        }

        let now = now_secs();
        let lifetime = i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX);
        let cookie_claims = TokenClaims {
            iat: now,
            exp: now.saturating_add(lifetime),
            ..claims
        };
        self.sealer.seal(&cookie_claims)
    }

    /// # Errors
    /// - `auth/invalid-session-cookie`, `auth/session-cookie-expired`
    /// - `auth/session-cookie-revoked` when `check_revoked` and revoked
    pub fn verify_session_cookie(&self, cookie: &str, check_revoked: bool) -> Result<TokenClaims> {
        let claims = self.sealer.open(cookie, now_secs())?;
        if claims.iss != self.identity.project_id() {
            return Err(Error::auth(
                AuthErrorCode::InvalidSessionCookie,
                "Session cookie belongs to another project",
            ));
        }
        if check_revoked && self.identity.is_revoked(&claims)? {
            return Err(Error::auth(
                AuthErrorCode::SessionCookieRevoked,
                "The session cookie has been revoked",
            ));
        }
        Ok(claims)
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn user_not_found() -> Error {
    Error::auth(AuthErrorCode::UserNotFound, "No user record for the identifier")
}

/// Trim and lowercase an email address, rejecting obviously invalid ones.
fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(Error::auth(
            AuthErrorCode::InvalidEmail,
            "The email address is badly formatted",
        ));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_up_then_sign_in() {
        let identity = IdentityService::new("garage");
        let (record, issued) = identity.sign_up(" Rider@Example.com ", "chainring").unwrap();
        assert_eq!(record.email.as_deref(), Some("rider@example.com"));
        assert_eq!(issued.claims.sub, record.uid);

        let (again, _) = identity.sign_in("rider@example.com", "chainring").unwrap();
        assert_eq!(again.uid, record.uid);

        let err = identity.sign_in("rider@example.com", "wrong-pass").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidCredential));
        let err = identity.sign_in("nobody@example.com", "chainring").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidCredential));
    }

    #[test]
    fn test_sign_up_rejections() {
        let identity = IdentityService::new("garage");
        let err = identity.sign_up("not-an-email", "chainring").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidEmail));
        let err = identity.sign_up("a@example.com", "abc").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::WeakPassword));

        identity.sign_up("a@example.com", "chainring").unwrap();
        let err = identity.sign_up("A@example.com", "chainring").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::EmailAlreadyInUse));
    }

    #[test]
    fn test_verification_code_applies_once() {
        let identity = IdentityService::new("garage");
        let (record, issued) = identity.sign_up("a@example.com", "chainring").unwrap();
        identity.send_verification(&issued.token).unwrap();

        let message = identity.outbox().pop().unwrap();
        assert_eq!(message.to, "a@example.com");
        let verified = identity.apply_action_code(&message.code).unwrap();
        assert!(verified.email_verified);
        assert!(identity.lookup(&record.uid).unwrap().email_verified);

        let err = identity.apply_action_code(&message.code).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidActionCode));
    }

    #[test]
    fn test_session_cookie_and_revocation() {
        let identity = Arc::new(IdentityService::new("garage"));
        let admin = AdminSession::new(
            Arc::clone(&identity),
            &SecretString::new("service-key"),
            None,
        )
        .unwrap();
        let (record, issued) = identity.sign_up("a@example.com", "chainring").unwrap();

        let err = admin
            .create_session_cookie(&issued.token, Duration::from_secs(60))
            .unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidSessionCookieDuration));

        let cookie = admin
            .create_session_cookie(&issued.token, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(admin.verify_session_cookie(&cookie, true).unwrap().sub, record.uid);

        identity.revoke(&record.uid).unwrap();
        assert!(admin.verify_session_cookie(&cookie, false).is_ok());
        let err = admin.verify_session_cookie(&cookie, true).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::SessionCookieRevoked));

        let err = identity.refresh(&issued.token).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::IdTokenRevoked));

        // Signing in again starts a valid session.
        let (_, fresh) = identity.sign_in("a@example.com", "chainring").unwrap();
        assert!(identity.refresh(&fresh.token).is_ok());
    }

    #[test]
    fn test_cookie_from_other_key_rejected() {
        let identity = Arc::new(IdentityService::new("garage"));
        let admin = AdminSession::new(Arc::clone(&identity), &SecretString::new("k1"), None).unwrap();
        let other = AdminSession::new(Arc::clone(&identity), &SecretString::new("k2"), None).unwrap();
        let (_, issued) = identity.sign_up("a@example.com", "chainring").unwrap();

        let cookie = other
            .create_session_cookie(&issued.token, Duration::from_secs(600))
            .unwrap();
        let err = admin.verify_session_cookie(&cookie, false).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidSessionCookie));
    }
}
