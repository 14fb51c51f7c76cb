//! Accounts and sessions, stored in the project database.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use gearshed_backend::{auto_id, UserRecord};
use gearshed_common::{AuthErrorCode, Error, Result, SecretString};
use gearshed_crypto::{
    hash_password, validate_cookie_lifetime, validate_password, verify_password, CookieSealer,
    SigningKey, TokenClaims, TokenSigner, ID_TOKEN_LIFETIME_SECS,
};

use super::sqlite_error;

/// Lifetime of an emailed action code.
pub const ACTION_CODE_LIFETIME_SECS: i64 = 24 * 60 * 60;

const SESSION_KEY_PURPOSE: &[u8] = b"gearshed-relational-session-cookie";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _auth_users (
        uid TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        email_verified INTEGER NOT NULL DEFAULT 0,
        display_name TEXT,
        photo_url TEXT,
        password_hash TEXT NOT NULL,
        valid_since INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS _auth_codes (
        code TEXT PRIMARY KEY,
        uid TEXT NOT NULL,
        kind TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS _auth_outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient TEXT NOT NULL,
        kind TEXT NOT NULL,
        code TEXT NOT NULL
    );
";

const USER_COLUMNS: &str = "uid, email, email_verified, display_name, photo_url";

/// An issued access token and its claims.
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

impl ActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::VerifyEmail => "verify_email",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "verify_email" => Ok(Self::VerifyEmail),
            other => Err(Error::Backend(format!("Unknown action kind '{}'", other))),
        }
    }
}

/// A message the auth service would have emailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub to: String,
    pub kind: ActionKind,
    pub code: String,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        uid: row.get(0)?,
        email: row.get(1)?,
        email_verified: row.get(2)?,
        display_name: row.get(3)?,
        photo_url: row.get(4)?,
    })
}

/// Email and password accounts of one project.
pub struct IdentityService {
    conn: Arc<Mutex<Connection>>,
    signer: TokenSigner,
}

impl IdentityService {
    /// # Errors
    /// - `Backend` when the auth tables cannot be created
    pub fn new(conn: Arc<Mutex<Connection>>, project_url: &str) -> Result<Self> {
        conn.lock()
            .execute_batch(SCHEMA)
            .map_err(|e| sqlite_error("create auth tables", e))?;
        Ok(Self {
            conn,
            signer: TokenSigner::new(SigningKey::generate(), project_url),
        })
    }

    pub fn project_url(&self) -> &str {
        self.signer.issuer()
    }

    /// Create an account and issue its first token.
    ///
    /// # Errors
    /// - `auth/invalid-email`, `auth/weak-password`
    /// - `auth/email-already-in-use`
    pub fn sign_up(&self, email: &str, password: &str) -> Result<(UserRecord, IssuedToken)> {
        let email = normalize_email(email)?;
        validate_password(password)?;
        let password_hash = hash_password(password)?;

        let uid = auto_id();
        {
            let conn = self.conn.lock();
            let taken: Option<String> = conn
                .query_row(
                    "SELECT uid FROM _auth_users WHERE email = ?1",
                    params![email],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| sqlite_error("look up account", e))?;
            if taken.is_some() {
                return Err(Error::auth(
                    AuthErrorCode::EmailAlreadyInUse,
                    "A user with this email address has already been registered",
                ));
            }
            conn.execute(
                "INSERT INTO _auth_users (uid, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![uid, email, password_hash, Utc::now().to_rfc3339()],
            )
            .map_err(|e| sqlite_error("create account", e))?;
        }

        info!(uid = %uid, "Created account");
        let record = UserRecord {
            uid,
            email: Some(email),
            email_verified: false,
            display_name: None,
            photo_url: None,
        };
        let issued = self.issue(&record, now_secs())?;
        Ok((record, issued))
    }

    /// Check a password and issue a token.
    ///
    /// # Errors
    /// - `auth/invalid-credential` for an unknown email or a wrong password
    pub fn sign_in(&self, email: &str, password: &str) -> Result<(UserRecord, IssuedToken)> {
        let email = normalize_email(email)?;
        let rejected = || Error::auth(AuthErrorCode::InvalidCredential, "Invalid login credentials");

        let found = self
            .conn
            .lock()
            .query_row(
                &format!(
                    "SELECT {}, password_hash, valid_since FROM _auth_users WHERE email = ?1",
                    USER_COLUMNS
                ),
                params![email],
                |row| Ok((user_from_row(row)?, row.get::<_, String>(5)?, row.get::<_, i64>(6)?)),
            )
            .optional()
            .map_err(|e| sqlite_error("look up account", e))?;
        let (record, password_hash, valid_since) = found.ok_or_else(rejected)?;

        if !verify_password(password, &password_hash)? {
            return Err(rejected());
        }

        // A sign-in in the second of a revocation must stay valid.
        let issued = self.issue(&record, now_secs().max(valid_since))?;
        debug!(uid = %record.uid, "Signed in");
        Ok((record, issued))
    }

    /// Issue a fresh token for the session `token` belongs to, even when
    /// the old token has expired.
    ///
    /// # Errors
    /// - `auth/argument-error` for a token not issued here
    /// - `auth/user-not-found`, `auth/id-token-revoked`
    pub fn refresh(&self, token: &str) -> Result<(UserRecord, IssuedToken)> {
        let claims = self.signer.verify(token, i64::MIN)?;
        let (record, valid_since) = self.account(&claims.sub)?;
        if claims.auth_time < valid_since {
            return Err(Error::auth(
                AuthErrorCode::IdTokenRevoked,
                "The refresh token has been revoked",
            ));
        }
        let issued = self.issue(&record, claims.auth_time)?;
        Ok((record, issued))
    }

    /// # Errors
    /// - `auth/argument-error` when malformed, tampered or foreign
    /// - `auth/id-token-expired`
    pub fn verify_token(&self, token: &str) -> Result<TokenClaims> {
        self.signer.verify(token, now_secs())
    }

    /// # Errors
    /// - `auth/user-not-found` when the account is gone
    pub fn is_revoked(&self, claims: &TokenClaims) -> Result<bool> {
        Ok(claims.auth_time < self.account(&claims.sub)?.1)
    }

    pub fn lookup(&self, uid: &str) -> Result<Option<UserRecord>> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {} FROM _auth_users WHERE uid = ?1", USER_COLUMNS),
                params![uid],
                user_from_row,
            )
            .optional()
            .map_err(|e| sqlite_error("look up account", e))
    }

    /// Change the profile of the user `token` belongs to. `None` keeps a
    /// field unchanged.
    pub fn update_profile(
        &self,
        token: &str,
        display_name: Option<String>,
        photo_url: Option<String>,
    ) -> Result<UserRecord> {
        let claims = self.verify_token(token)?;
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE _auth_users
                 SET display_name = COALESCE(?2, display_name),
                     photo_url = COALESCE(?3, photo_url)
                 WHERE uid = ?1",
                params![claims.sub, display_name, photo_url],
            )
            .map_err(|e| sqlite_error("update profile", e))?;
        if changed == 0 {
            return Err(user_not_found());
        }
        Ok(self.account(&claims.sub)?.0)
    }

    /// Queue a confirmation code for the email of the user `token` belongs to.
    pub fn send_verification(&self, token: &str) -> Result<()> {
        let claims = self.verify_token(token)?;
        let (record, _) = self.account(&claims.sub)?;
        let email = record
            .email
            .ok_or_else(|| Error::InvalidInput("Account has no email address".to_string()))?;

        let code = auto_id();
        let kind = ActionKind::VerifyEmail;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| sqlite_error("begin transaction", e))?;
        tx.execute(
            "INSERT INTO _auth_codes (code, uid, kind, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![code, claims.sub, kind.as_str(), now_secs() + ACTION_CODE_LIFETIME_SECS],
        )
        .map_err(|e| sqlite_error("store action code", e))?;
        tx.execute(
            "INSERT INTO _auth_outbox (recipient, kind, code) VALUES (?1, ?2, ?3)",
            params![email, kind.as_str(), code],
        )
        .map_err(|e| sqlite_error("queue email", e))?;
        tx.commit().map_err(|e| sqlite_error("commit", e))?;

        debug!(uid = %claims.sub, "Queued confirmation email");
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
                "Email link is invalid or has expired",
            )
        };

        let uid = {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| sqlite_error("begin transaction", e))?;
            let pending: Option<(String, String, i64)> = tx
                .query_row(
                    "SELECT uid, kind, expires_at FROM _auth_codes WHERE code = ?1",
                    params![code],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(|e| sqlite_error("look up action code", e))?;
            let (uid, kind, expires_at) = pending.ok_or_else(invalid)?;
            tx.execute("DELETE FROM _auth_codes WHERE code = ?1", params![code])
                .map_err(|e| sqlite_error("consume action code", e))?;

            if expires_at <= now_secs() {
                tx.commit().map_err(|e| sqlite_error("commit", e))?;
                return Err(invalid());
            }
            match ActionKind::parse(&kind)? {
                ActionKind::VerifyEmail => {
                    tx.execute(
                        "UPDATE _auth_users SET email_verified = 1 WHERE uid = ?1",
                        params![uid],
                    )
                    .map_err(|e| sqlite_error("confirm email", e))?;
                }
            }
            tx.commit().map_err(|e| sqlite_error("commit", e))?;
            uid
        };

        Ok(self.account(&uid)?.0)
    }

    /// Revoke every session of `uid` started so far.
    pub fn revoke(&self, uid: &str) -> Result<()> {
        // Sessions started in the current second are revoked as well.
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE _auth_users SET valid_since = ?2 WHERE uid = ?1",
                params![uid, now_secs() + 1],
            )
            .map_err(|e| sqlite_error("revoke sessions", e))?;
        if changed == 0 {
            return Err(user_not_found());
        }
        info!(uid = %uid, "Revoked sessions");
        Ok(())
    }

    /// Messages queued so far, oldest first.
    pub fn outbox(&self) -> Result<Vec<OutboxMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT recipient, kind, code FROM _auth_outbox ORDER BY id")
            .map_err(|e| sqlite_error("read outbox", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| sqlite_error("read outbox", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| sqlite_error("read outbox", e))?;

        rows.into_iter()
            .map(|(to, kind, code)| {
                Ok(OutboxMessage {
                    to,
                    kind: ActionKind::parse(&kind)?,
                    code,
                })
            })
            .collect()
    }

    /// The account of `uid` and the time its sessions are valid since.
    fn account(&self, uid: &str) -> Result<(UserRecord, i64)> {
        self.conn
            .lock()
            .query_row(
                &format!(
                    "SELECT {}, valid_since FROM _auth_users WHERE uid = ?1",
                    USER_COLUMNS
                ),
                params![uid],
                |row| Ok((user_from_row(row)?, row.get(5)?)),
            )
            .optional()
            .map_err(|e| sqlite_error("look up account", e))?
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

/// Privileged access through the service role key.
pub struct AdminSession {
    identity: Arc<IdentityService>,
    sealer: CookieSealer,
}

impl AdminSession {
    /// # Errors
    /// - `Crypto` for an empty service role key
    pub fn new(identity: Arc<IdentityService>, service_role_key: &SecretString) -> Result<Self> {
        let key = SigningKey::from_secret(service_role_key.expose(), SESSION_KEY_PURPOSE)?;
        Ok(Self {
            identity,
            sealer: CookieSealer::new(key),
        })
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    /// Exchange a valid access token for a sealed session cookie.
    ///
    /// # Errors
    /// - `auth/invalid-session-cookie-duration` outside 5 minutes to 14 days
    /// - token verification errors, `auth/id-token-revoked`
    pub fn create_session_cookie(&self, token: &str, expires_in: Duration) -> Result<String> {
        validate_cookie_lifetime(expires_in)?;
        let claims = self.identity.verify_token(token)?;
        if self.identity.is_revoked(&claims)? {
            return Err(Error::auth(
                AuthErrorCode::IdTokenRevoked,
                "The access token has been revoked",
            ));
        }

        let now = now_secs();
        let lifetime = i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX);
        self.sealer.seal(&TokenClaims {
            iat: now,
            exp: now.saturating_add(lifetime),
            ..claims
        })
    }

    /// # Errors
    /// - `auth/invalid-session-cookie`, `auth/session-cookie-expired`
    /// - `auth/session-cookie-revoked` when `check_revoked` and revoked
    pub fn verify_session_cookie(&self, cookie: &str, check_revoked: bool) -> Result<TokenClaims> {
        let claims = self.sealer.open(cookie, now_secs())?;
        if claims.iss != self.identity.project_url() {
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
    Error::auth(AuthErrorCode::UserNotFound, "User not found")
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        })
        && !email.chars().any(char::is_whitespace);
    if !valid {
        return Err(Error::auth(
            AuthErrorCode::InvalidEmail,
            "Unable to validate email address: invalid format",
        ));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Arc<IdentityService> {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        Arc::new(IdentityService::new(conn, "http://garage.local").unwrap())
    }

    #[test]
    fn test_accounts_persist_in_tables() {
        let identity = identity();
        let (record, issued) = identity.sign_up("Rider@Example.com", "chainring").unwrap();
        assert_eq!(issued.claims.iss, "http://garage.local");
        assert_eq!(identity.lookup(&record.uid).unwrap(), Some(record.clone()));

        let err = identity.sign_up("rider@example.com", "chainring").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::EmailAlreadyInUse));
        let err = identity.sign_in("rider@example.com", "wrong-pass").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidCredential));
        assert!(identity.sign_in("rider@example.com", "chainring").is_ok());
    }

    #[test]
    fn test_profile_update_keeps_unset_fields() {
        let identity = identity();
        let (_, issued) = identity.sign_up("a@example.com", "chainring").unwrap();
        identity
            .update_profile(&issued.token, None, Some("https://img/a.png".to_string()))
            .unwrap();
        let record = identity
            .update_profile(&issued.token, Some("Rider".to_string()), None)
            .unwrap();
        assert_eq!(record.display_name.as_deref(), Some("Rider"));
        assert_eq!(record.photo_url.as_deref(), Some("https://img/a.png"));
    }

    #[test]
    fn test_confirmation_code() {
        let identity = identity();
        let (record, issued) = identity.sign_up("a@example.com", "chainring").unwrap();
        identity.send_verification(&issued.token).unwrap();

        let message = identity.outbox().unwrap().pop().unwrap();
        assert_eq!(message.kind, ActionKind::VerifyEmail);
        assert!(identity.apply_action_code(&message.code).unwrap().email_verified);
        assert!(identity.lookup(&record.uid).unwrap().unwrap().email_verified);

        let err = identity.apply_action_code(&message.code).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidActionCode));
    }

    #[test]
    fn test_revocation() {
        let identity = identity();
        let admin = AdminSession::new(Arc::clone(&identity), &SecretString::new("role-key")).unwrap();
        let (record, issued) = identity.sign_up("a@example.com", "chainring").unwrap();
        let cookie = admin
            .create_session_cookie(&issued.token, Duration::from_secs(600))
            .unwrap();

        identity.revoke(&record.uid).unwrap();
        let err = admin.verify_session_cookie(&cookie, true).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::SessionCookieRevoked));
        assert!(admin.verify_session_cookie(&cookie, false).is_ok());
        let err = identity.refresh(&issued.token).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::IdTokenRevoked));

        let err = identity.revoke("missing").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::UserNotFound));
    }
}
