//! Session storage and JWT inspection

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stored auth session (access/refresh token pair plus identity)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<u64>,
    pub user_id: String,
    pub email: Option<String>,
}

impl StoredSession {
    pub fn new(
        access_token: String,
        refresh_token: String,
        expires_in_secs: Option<u64>,
        user_id: String,
        email: Option<String>,
    ) -> Self {
        let expires_at = expires_in_secs.map(|secs| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + secs
        });

        Self {
            access_token,
            refresh_token,
            expires_at,
            user_id,
            email,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_secs();
                // Consider expired if less than 5 minutes remaining
                now + 300 >= exp
            }
            None => false,
        }
    }
}

/// Claims read out of an access token without verifying the signature.
/// Client-side convenience only; the service validates for real.
#[derive(Debug, Deserialize)]
pub struct JwtClaims {
    pub sub: Option<String>,
    pub exp: Option<u64>,
    pub email: Option<String>,
}

/// Decode the payload segment of a JWT.
pub fn decode_jwt_claims(token: &str) -> Option<JwtClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(payload: &str) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.{}",
            engine.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            engine.encode(payload),
            engine.encode("sig")
        )
    }

    #[test]
    fn test_session_not_expired_without_expiry() {
        let s = StoredSession::new("a".into(), "r".into(), None, "u".into(), None);
        assert!(!s.is_expired());
    }

    #[test]
    fn test_session_expired_within_margin() {
        // Expires in 60s, inside the 5-minute margin.
        let s = StoredSession::new("a".into(), "r".into(), Some(60), "u".into(), None);
        assert!(s.is_expired());
    }

    #[test]
    fn test_session_valid_outside_margin() {
        let s = StoredSession::new("a".into(), "r".into(), Some(3600), "u".into(), None);
        assert!(!s.is_expired());
    }

    #[test]
    fn test_decode_jwt_claims() {
        let token = make_jwt(r#"{"sub":"user-1","exp":4102444800,"email":"a@b.c"}"#);
        let claims = decode_jwt_claims(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user-1"));
        assert_eq!(claims.exp, Some(4102444800));
        assert_eq!(claims.email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn test_decode_jwt_claims_rejects_garbage() {
        assert!(decode_jwt_claims("not-a-jwt").is_none());
        assert!(decode_jwt_claims("a.!!.c").is_none());
    }
}
