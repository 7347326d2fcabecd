/// Token verification boundary and role authorization
use anyhow::{anyhow, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::GatewayError;

/// Claims extracted from a verified token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Token subject (`sub`)
    pub subject: Option<String>,
    /// Roles granted to the caller
    pub roles: Vec<String>,
    /// Full decoded payload
    pub raw: Value,
}

impl Claims {
    /// Whether any of the caller's roles is in `required`
    pub fn has_any_role(&self, required: &BTreeSet<String>) -> bool {
        self.roles.iter().any(|role| required.contains(role))
    }
}

/// Opaque token verifier; the gateway only consumes its result
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` against `secret`, returning its claims or the rejection reason
    fn verify(&self, token: &str, secret: &str) -> Result<Claims>;
}

/// Compact JWT verifier for HMAC-SHA256 signed tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct Hs256Verifier;

impl TokenVerifier for Hs256Verifier {
    fn verify(&self, token: &str, secret: &str) -> Result<Claims> {
        use hmac::{Hmac, Mac};
        type HmacSha256 = Hmac<sha2::Sha256>;

        // HMAC accepts an empty key
        if secret.is_empty() {
            return Err(anyhow!("No signing secret configured"));
        }

        let engine = base64::prelude::BASE64_URL_SAFE_NO_PAD;

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(anyhow!("Malformed JWT"));
        }

        // Decode header to check algorithm
        let header_bytes = engine
            .decode(parts[0])
            .map_err(|_| anyhow!("Invalid JWT header encoding"))?;
        let header: Value = serde_json::from_slice(&header_bytes)
            .map_err(|_| anyhow!("Invalid JWT header JSON"))?;
        match header.get("alg").and_then(|v| v.as_str()) {
            Some("HS256") => {}
            Some(other) => return Err(anyhow!("Unsupported JWT algorithm: {}", other)),
            None => return Err(anyhow!("JWT header has no algorithm")),
        }

        let signature = engine
            .decode(parts[2])
            .map_err(|_| anyhow!("Invalid JWT signature encoding"))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| anyhow!("Invalid HMAC key"))?;
        mac.update(parts[0].as_bytes());
        mac.update(b".");
        mac.update(parts[1].as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&signature)
            .map_err(|_| anyhow!("JWT signature mismatch"))?;

        let payload_bytes = engine
            .decode(parts[1])
            .map_err(|_| anyhow!("Invalid JWT payload encoding"))?;
        let payload: Value = serde_json::from_slice(&payload_bytes)
            .map_err(|_| anyhow!("Invalid JWT payload JSON"))?;

        let current_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if let Some(exp) = payload.get("exp").and_then(|v| v.as_i64()) {
            if current_time >= exp {
                return Err(anyhow!("Token expired"));
            }
        }
        if let Some(nbf) = payload.get("nbf").and_then(|v| v.as_i64()) {
            if current_time < nbf {
                return Err(anyhow!("Token not yet valid"));
            }
        }

        let roles = match payload.get("roles") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(role)) => vec![role.clone()],
            _ => Vec::new(),
        };

        Ok(Claims {
            subject: payload
                .get("sub")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            roles,
            raw: payload,
        })
    }
}

/// Pull the token out of a header value, dropping an optional `Bearer ` prefix
pub fn extract_token(header_value: Option<&str>) -> Option<&str> {
    let value = header_value?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// Authenticate the token, then check the route's role requirement.
///
/// A bad or missing token is `Unauthenticated`, as is any token when no secret
/// is configured; a valid token lacking every required role is `Unauthorized`.
pub fn authenticate(
    verifier: &dyn TokenVerifier,
    header_value: Option<&str>,
    secret: &str,
    required_roles: &BTreeSet<String>,
) -> Result<Claims, GatewayError> {
    let token = extract_token(header_value)
        .ok_or_else(|| GatewayError::Unauthenticated("missing token".to_string()))?;

    if secret.is_empty() {
        return Err(GatewayError::Unauthenticated(
            "no signing secret configured".to_string(),
        ));
    }

    let claims = verifier
        .verify(token, secret)
        .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;

    if !required_roles.is_empty() && !claims.has_any_role(required_roles) {
        return Err(GatewayError::Unauthorized);
    }

    Ok(claims)
}

/// Sign a payload as an HS256 JWT; counterpart of [`Hs256Verifier`]
pub fn sign_hs256(payload: &Value, secret: &str) -> Result<String> {
    use hmac::{Hmac, Mac};
    type HmacSha256 = Hmac<sha2::Sha256>;

    let engine = base64::prelude::BASE64_URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = engine.encode(serde_json::to_vec(payload)?);
    let signing_input = format!("{}.{}", header, body);

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| anyhow!("Invalid HMAC key"))?;
    mac.update(signing_input.as_bytes());
    let signature = engine.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "front-desk-secret";

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_token_yields_claims() {
        let token = sign_hs256(&json!({"sub": "guest-42", "roles": ["guest"]}), SECRET).unwrap();
        let claims = Hs256Verifier.verify(&token, SECRET).unwrap();
        assert_eq!(claims.subject.as_deref(), Some("guest-42"));
        assert_eq!(claims.roles, vec!["guest".to_string()]);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign_hs256(&json!({"sub": "guest-42"}), SECRET).unwrap();
        assert!(Hs256Verifier.verify(&token, "other").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = sign_hs256(&json!({"sub": "x", "exp": 1}), SECRET).unwrap();
        let err = Hs256Verifier.verify(&token, SECRET).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_extract_token_strips_bearer() {
        assert_eq!(extract_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_token(Some("abc")), Some("abc"));
        assert_eq!(extract_token(Some("Bearer ")), None);
        assert_eq!(extract_token(None), None);
    }

    #[test]
    fn test_authenticate_separates_401_and_403() {
        let token = sign_hs256(&json!({"sub": "g", "roles": ["guest"]}), SECRET).unwrap();
        let header = format!("Bearer {}", token);

        let ok = authenticate(&Hs256Verifier, Some(&header), SECRET, &roles(&["guest", "staff"]));
        assert!(ok.is_ok());

        let forbidden = authenticate(&Hs256Verifier, Some(&header), SECRET, &roles(&["staff"]));
        assert!(matches!(forbidden, Err(GatewayError::Unauthorized)));

        let missing = authenticate(&Hs256Verifier, None, SECRET, &BTreeSet::new());
        assert!(matches!(missing, Err(GatewayError::Unauthenticated(_))));

        let tampered = authenticate(&Hs256Verifier, Some("Bearer a.b.c"), SECRET, &BTreeSet::new());
        assert!(matches!(tampered, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_empty_secret_rejects_every_token() {
        let forged = sign_hs256(&json!({"sub": "intruder", "roles": ["admin"]}), "").unwrap();
        assert!(Hs256Verifier.verify(&forged, "").is_err());

        let header = format!("Bearer {}", forged);
        let result = authenticate(&Hs256Verifier, Some(&header), "", &roles(&["admin"]));
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }
}
