use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Form,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::config::{OperatorConfig, OperatorPassword};
use crate::error::{Result, TombolaError};

pub const SESSION_COOKIE: &str = "session";
const SESSION_DURATION: u64 = 24 * 60 * 60; // 24 hours in seconds

/// The one account allowed to use the ticket office.
#[derive(Debug, Clone)]
pub struct Operator {
    pub username: String,
    password_hash: String,
}

impl Operator {
    /// Build from configuration, hashing a plain password once at startup.
    pub fn from_config(config: &OperatorConfig) -> Result<Self> {
        let password_hash = match &config.password {
            OperatorPassword::Hash(hash) => {
                PasswordHash::new(hash).map_err(|e| {
                    TombolaError::Config(format!("OPERATOR_PASSWORD_HASH is not an argon2 hash: {}", e))
                })?;
                hash.clone()
            }
            OperatorPassword::Plain(password) => hash_password(password)?,
        };
        Ok(Operator {
            username: config.user.clone(),
            password_hash,
        })
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        username == self.username && verify_password(password, &self.password_hash)
    }
}

/// Credential data posted by the login form
#[derive(Debug, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub error: Option<String>,
}

/// An authenticated operator session
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub expires_at: SystemTime,
}

/// Active sessions, owned by the application state.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create a session for `username` and return its id.
    pub fn create(&self, username: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            user_id: username.to_string(),
            expires_at: SystemTime::now() + Duration::from_secs(SESSION_DURATION),
        };

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, s| s.expires_at > SystemTime::now());
        sessions.insert(session_id.clone(), session);
        session_id
    }

    /// The username behind a session id, if the session is still valid.
    pub fn validate(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .filter(|s| s.expires_at > SystemTime::now())
            .map(|s| s.user_id.clone())
    }

    pub fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id);
    }
}

/// Hash a password using Argon2
///
/// # Errors
/// * Returns an error if the password hashing fails
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TombolaError::Config(format!("password hashing failed: {}", e)))
}

/// Verify a password against a stored Argon2 hash; malformed hashes never match.
fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Serve the login page
pub async fn serve_login_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
) -> Response {
    match state.render("login", &serde_json::json!({ "error": query.error })) {
        Ok(html) => Html(html).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Handle operator login
///
/// Sets the session cookie and goes to the orders page, or back to the form.
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<UserCredentials>,
) -> Response {
    let Some(operator) = &state.operator else {
        return Redirect::to("/").into_response();
    };

    if operator.verify(&credentials.username, &credentials.password) {
        let session_id = state.sessions.create(&credentials.username);
        info!("Operator {} logged in", credentials.username);
        let cookie = Cookie::build((SESSION_COOKIE, session_id))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax);
        (jar.add(cookie), Redirect::to("/")).into_response()
    } else {
        warn!("Failed login for {}", credentials.username);
        Redirect::to("/login?error=Invalid+username+or+password").into_response()
    }
}

/// Handle operator logout
pub async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value());
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Redirect::to("/login"),
    )
}

/// Authentication middleware
///
/// Lets a request through when it carries a valid session, or when no
/// operator is configured at all. Otherwise redirects to the login page.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if state.operator.is_none() {
        return next.run(request).await;
    }

    if let Some(session_cookie) = jar.get(SESSION_COOKIE) {
        if let Some(username) = state.sessions.validate(session_cookie.value()) {
            request.extensions_mut().insert(username);
            return next.run(request).await;
        }
    }

    if request.uri().path().starts_with("/api/") {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    Redirect::to("/login").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_password_is_hashed_and_verified() {
        let operator = Operator::from_config(&OperatorConfig {
            user: "caisse".to_string(),
            password: OperatorPassword::Plain("tombola".to_string()),
        })
        .unwrap();

        assert!(operator.password_hash.starts_with("$argon2"));
        assert!(operator.verify("caisse", "tombola"));
        assert!(!operator.verify("caisse", "wrong"));
        assert!(!operator.verify("other", "tombola"));
    }

    #[test]
    fn configured_hash_must_be_argon2() {
        let hash = hash_password("tombola").unwrap();
        let operator = Operator::from_config(&OperatorConfig {
            user: "caisse".to_string(),
            password: OperatorPassword::Hash(hash),
        })
        .unwrap();
        assert!(operator.verify("caisse", "tombola"));

        let err = Operator::from_config(&OperatorConfig {
            user: "caisse".to_string(),
            password: OperatorPassword::Hash("plaintext".to_string()),
        })
        .unwrap_err();
        assert!(matches!(err, TombolaError::Config(_)));
    }

    #[test]
    fn sessions_validate_until_removed() {
        let sessions = SessionStore::default();
        let id = sessions.create("caisse");

        assert_eq!(sessions.validate(&id).as_deref(), Some("caisse"));
        assert_eq!(sessions.validate("unknown"), None);

        sessions.remove(&id);
        assert_eq!(sessions.validate(&id), None);
    }
}
