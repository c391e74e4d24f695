use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use {
    argon2::Argon2,
    axum::http::{HeaderMap, header},
    jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    rand::{Rng, distr::Alphanumeric},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::warn,
    wagate_config::AuthConfig,
    wagate_sessions::metadata::now_secs,
};

use crate::error::GatewayError;

// ── Types ────────────────────────────────────────────────────────────────────

/// Access-token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub token_type: &'static str,
    /// Unix seconds.
    pub expires_at: i64,
}

/// Signs and verifies HS256 access tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

/// Configured operator credentials.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Option<Secret<String>>,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

pub fn is_argon2_hash(value: &str) -> bool {
    value.starts_with("$argon2")
}

/// Argon2id PHC string for `plain`.
pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let mut salt = [0u8; 16];
    rand::rng().fill(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| anyhow::anyhow!("encode salt: {e}"))?;
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Check `given` against a plain or argon2-hashed expected password.
pub fn verify_password(expected: &str, given: &str) -> bool {
    if !is_argon2_hash(expected) {
        return safe_equal(expected, given);
    }
    match PasswordHash::new(expected) {
        Ok(hash) => Argon2::default()
            .verify_password(given.as_bytes(), &hash)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "configured password hash is malformed");
            false
        },
    }
}

pub fn random_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

/// `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Client address for rate limiting. Forwarding headers are only honoured
/// behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()));
        if let Some(ip) = forwarded.and_then(|v| v.trim().parse().ok()) {
            return ip;
        }
    }
    peer.ip()
}

// ── Auth logic ───────────────────────────────────────────────────────────────

impl TokenSigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Use the configured secret, or a per-process random one.
    pub fn from_config(auth: &AuthConfig) -> Self {
        match &auth.jwt_secret {
            Some(secret) => Self::new(secret.expose_secret().as_bytes(), auth.token_ttl()),
            None => {
                warn!("no jwt_secret configured, tokens will not survive a restart");
                Self::new(random_secret().as_bytes(), auth.token_ttl())
            },
        }
    }

    pub fn issue(&self, subject: &str) -> anyhow::Result<IssuedToken> {
        let iat = now_secs();
        let exp = iat + self.ttl.as_secs() as i64;
        let claims = Claims {
            sub: subject.to_string(),
            iat,
            exp,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken {
            token,
            token_type: "Bearer",
            expires_at: exp,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Unauthorized(format!("invalid token: {e}")))
    }
}

impl Credentials {
    pub fn from_config(auth: &AuthConfig) -> Self {
        if auth.password.is_none() {
            warn!("no auth.password configured, login is disabled");
        }
        Self {
            username: auth.username.clone(),
            password: auth.password.clone(),
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some(expected) = &self.password else {
            return false;
        };
        // Evaluate both so a wrong username costs the same as a wrong password.
        let user_ok = safe_equal(&self.username, username);
        let pass_ok = verify_password(expected.expose_secret(), password);
        user_ok && pass_ok
    }
}

#[cfg(test)]
mod tests {
    use {super::*, axum::http::HeaderValue};

    fn auth_config(password: &str) -> AuthConfig {
        AuthConfig {
            password: Some(Secret::new(password.to_string())),
            jwt_secret: Some(Secret::new("test-secret".into())),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn safe_equal_compares_content() {
        assert!(safe_equal("hunter2", "hunter2"));
        assert!(!safe_equal("hunter2", "hunter3"));
        assert!(!safe_equal("short", "longer"));
    }

    #[test]
    fn plain_and_hashed_passwords() {
        let creds = Credentials::from_config(&auth_config("s3cret"));
        assert!(creds.verify("admin", "s3cret"));
        assert!(!creds.verify("admin", "wrong"));
        assert!(!creds.verify("root", "s3cret"));

        let hash = hash_password("s3cret").unwrap();
        assert!(is_argon2_hash(&hash));
        let creds = Credentials::from_config(&auth_config(&hash));
        assert!(creds.verify("admin", "s3cret"));
        assert!(!creds.verify("admin", "s3cre"));
    }

    #[test]
    fn login_disabled_without_password() {
        let creds = Credentials::from_config(&AuthConfig::default());
        assert!(!creds.verify("admin", ""));
    }

    #[test]
    fn tokens_round_trip_and_reject_tampering() {
        let signer = TokenSigner::from_config(&auth_config("x"));
        let issued = signer.issue("admin").unwrap();
        let claims = signer.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.exp, issued.expires_at);

        let other = TokenSigner::new(b"other-secret", Duration::from_secs(60));
        assert!(matches!(
            other.verify(&issued.token),
            Err(GatewayError::Unauthorized(_))
        ));
        assert!(signer.verify("not.a.token").is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = TokenSigner::new(b"k", Duration::from_secs(60));
        let claims = Claims {
            sub: "admin".into(),
            iat: now_secs() - 120,
            exp: now_secs() - 60,
        };
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &signer.encoding).unwrap();
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_for_only_behind_trusted_proxy() {
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        assert_eq!(client_ip(&headers, peer, false), peer.ip());
        assert_eq!(
            client_ip(&headers, peer, true),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
    }
}
