//! Authentication against the backend's auth service
//!
//! Password-grant sign in, signup, refresh and logout over the GoTrue
//! REST endpoints. The session is persisted in the config file and
//! refreshed with the stored refresh token when it expires.

pub mod session;

pub use session::{decode_jwt_claims, StoredSession};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::Config;

/// Token endpoint response (password and refresh_token grants).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: Option<u64>,
    user: Option<AuthUser>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

/// Error body from the auth service (field names vary across versions).
#[derive(Debug, Deserialize)]
struct AuthErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    error: Option<String>,
}

fn auth_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let detail = serde_json::from_str::<AuthErrorBody>(body)
        .ok()
        .and_then(|e| e.error_description.or(e.msg).or(e.error))
        .unwrap_or_else(|| body.to_string());
    anyhow::anyhow!("Auth request failed ({}): {}", status.as_u16(), detail)
}

async fn post_token(
    config: &Config,
    grant_type: &str,
    body: serde_json::Value,
) -> Result<TokenResponse> {
    let base = config.backend_url()?;
    let anon = config.anon_key()?;
    let url = format!("{}/auth/v1/token?grant_type={}", base, grant_type);

    let resp = reqwest::Client::new()
        .post(&url)
        .header("apikey", &anon)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {} failed", url))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(auth_error(status, &text));
    }
    resp.json().await.context("Failed to parse token response")
}

fn store_session(config: &mut Config, tokens: TokenResponse) -> Result<StoredSession> {
    let claims = decode_jwt_claims(&tokens.access_token);

    // Prefer the user block; fall back to the JWT claims.
    let (user_id, email) = match tokens.user {
        Some(u) => (u.id, u.email),
        None => {
            let sub = claims.as_ref().and_then(|c| c.sub.clone());
            (
                sub.context("Token response carried no user id")?,
                claims.as_ref().and_then(|c| c.email.clone()),
            )
        }
    };

    let mut session = StoredSession::new(
        tokens.access_token,
        tokens.refresh_token,
        tokens.expires_in,
        user_id,
        email,
    );
    // Responses without expires_in still carry the expiry in the token.
    if session.expires_at.is_none() {
        session.expires_at = claims.and_then(|c| c.exp);
    }
    config.set_session(session.clone());
    config.save()?;
    Ok(session)
}

/// Sign in with email and password.
pub async fn login(email: &str, password: &str) -> Result<()> {
    let mut config = Config::load()?;

    let tokens = post_token(
        &config,
        "password",
        serde_json::json!({ "email": email, "password": password }),
    )
    .await?;

    let session = store_session(&mut config, tokens)?;
    println!(
        "Signed in as {} ({})",
        session.email.as_deref().unwrap_or(email),
        session.user_id
    );
    Ok(())
}

/// Create an account. Profile fields ride along as signup metadata; the
/// service creates the `profiles` row via trigger.
///
/// Returns the session when the project auto-confirms signups, `None`
/// when email confirmation is pending.
pub async fn signup(
    email: &str,
    password: &str,
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> Result<Option<StoredSession>> {
    let mut config = Config::load()?;
    let base = config.backend_url()?;
    let anon = config.anon_key()?;
    let url = format!("{}/auth/v1/signup", base);

    let body = serde_json::json!({
        "email": email,
        "password": password,
        "data": {
            "username": username,
            "first_name": first_name,
            "last_name": last_name,
        },
    });

    let resp = reqwest::Client::new()
        .post(&url)
        .header("apikey", &anon)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {} failed", url))?;

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(auth_error(status, &text));
    }

    // Auto-confirm projects return a full session; confirmation-required
    // projects return just the user.
    if let Ok(tokens) = serde_json::from_str::<TokenResponse>(&text) {
        let session = store_session(&mut config, tokens)?;
        println!("Account created, signed in as {}", session.user_id);
        Ok(Some(session))
    } else {
        println!("Account created. Check your email to confirm, then run 'huddle-cli login'.");
        Ok(None)
    }
}

/// Refresh the stored session with its refresh token.
///
/// Returns `Ok(true)` if a new session was stored, `Ok(false)` when no
/// session exists to refresh.
pub async fn refresh() -> Result<bool> {
    let mut config = Config::load()?;
    let refresh_token = match config.get_session() {
        Some(s) => s.refresh_token,
        None => return Ok(false),
    };

    tracing::info!("Refreshing session...");
    let tokens = post_token(
        &config,
        "refresh_token",
        serde_json::json!({ "refresh_token": refresh_token }),
    )
    .await?;

    store_session(&mut config, tokens)?;
    tracing::info!("Session refreshed");
    Ok(true)
}

/// Sign out: revoke server-side (best effort) and clear the stored session.
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;

    if let Some(session) = config.get_session() {
        let base = config.backend_url()?;
        let anon = config.anon_key()?;
        let url = format!("{}/auth/v1/logout", base);

        let result = reqwest::Client::new()
            .post(&url)
            .header("apikey", &anon)
            .bearer_auth(&session.access_token)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("Server-side logout failed: {:#}", e);
        }
    }

    config.clear_session();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    match config.backend_url.as_deref() {
        Some(url) => println!("Backend:  {}", url),
        None => println!("Backend:  (not configured)"),
    }

    match config.get_session() {
        Some(session) if !session.is_expired() => {
            println!("Session:  valid");
            println!("  user:   {}", session.user_id);
            if let Some(ref email) = session.email {
                println!("  email:  {}", email);
            }
            if let Some(exp) = session.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(session) => {
            println!("Session:  expired (refresh token present)");
            println!("  user:   {}", session.user_id);
        }
        None => {
            println!("Session:  none");
            println!("\nRun 'huddle-cli login' to authenticate.");
        }
    }

    Ok(())
}
