use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::secrets::SigningKey;
use crate::storage::models::{Key, KeyType};
use crate::AuthError;

/// JWT claims carried by every issued key
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Key ID, absent for login keys
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jti: String,
    /// Issuer
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Subject that requested the key
    #[serde(default)]
    pub issuer_id: String,
    /// Issued at (as Unix timestamp)
    pub iat: i64,
    /// Expiration time (as Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Key type
    #[serde(rename = "typ")]
    pub key_type: KeyType,
}

/// Signs keys into compact JWTs and reads them back
///
/// Expiry is not validated on decode; the token manager checks it against
/// its clock.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    issuer: String,
    signing_key: SigningKey,
}

impl KeyCodec {
    pub fn new(issuer: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            issuer: issuer.into(),
            signing_key,
        }
    }

    /// Sign `key`, returning the opaque token
    pub fn encode(&self, key: &Key) -> Result<String, AuthError> {
        let claims = Claims {
            jti: key.id.clone(),
            iss: self.issuer.clone(),
            sub: key.subject.clone(),
            issuer_id: key.issuer_id.clone(),
            iat: key.issued_at.timestamp(),
            exp: key.expires_at.map(|at| at.timestamp()),
            key_type: key.key_type,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            self.signing_key.encoding(),
        )
        .map_err(AuthError::Signing)
    }

    /// Verify the signature and issuer of `token` and rebuild the key
    pub fn decode(&self, token: &str) -> Result<Key, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        validation.set_issuer(&[&self.issuer]);

        let claims = decode::<Claims>(token, self.signing_key.decoding(), &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?
            .claims;

        let issued_at = timestamp(claims.iat)?;
        let expires_at = claims.exp.map(timestamp).transpose()?;

        Ok(Key {
            id: claims.jti,
            key_type: claims.key_type,
            issuer_id: claims.issuer_id,
            subject: claims.sub,
            issued_at,
            expires_at,
            secret: token.to_owned(),
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AuthError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AuthError::InvalidToken(format!("timestamp out of range: {secs}")))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound};

    use super::*;

    fn codec(secret: &[u8]) -> KeyCodec {
        KeyCodec::new("flux-auth", SigningKey::from_secret(secret))
    }

    #[test]
    fn test_decode_restores_claims() {
        let codec = codec(b"secret");
        let now = Utc::now().trunc_subsecs(0);
        let mut key = Key::new(KeyType::Api, "device-7").with_expiry(now + Duration::hours(1));
        key.id = "k-1".to_owned();
        key.issuer_id = "user@example.com".to_owned();
        key.issued_at = now;

        let token = codec.encode(&key).unwrap();
        let decoded = codec.decode(&token).unwrap();

        assert_eq!(decoded.id, "k-1");
        assert_eq!(decoded.subject, "device-7");
        assert_eq!(decoded.issuer_id, "user@example.com");
        assert_eq!(decoded.issued_at, now);
        assert_eq!(decoded.expires_at, Some(now + Duration::hours(1)));
        assert_eq!(decoded.secret, token);
    }

    #[test]
    fn test_expired_token_still_decodes() {
        let codec = codec(b"secret");
        let past = Utc::now().trunc_subsecs(0) - Duration::days(2);
        let mut key = Key::new(KeyType::Login, "u1").with_expiry(past + Duration::hours(1));
        key.issued_at = past;

        let decoded = codec.decode(&codec.encode(&key).unwrap()).unwrap();

        assert!(decoded.is_expired(Utc::now()));
    }

    #[test]
    fn test_rejects_foreign_signature_and_issuer() {
        let key = Key::new(KeyType::Login, "u1");
        let token = codec(b"other").encode(&key).unwrap();

        assert!(matches!(
            codec(b"secret").decode(&token),
            Err(AuthError::InvalidToken(_))
        ));

        let foreign = KeyCodec::new("someone-else", SigningKey::from_secret(b"secret"));
        let token = foreign.encode(&key).unwrap();
        assert!(matches!(
            codec(b"secret").decode(&token),
            Err(AuthError::InvalidToken(_))
        ));

        assert!(matches!(
            codec(b"secret").decode("not-a-token"),
            Err(AuthError::InvalidToken(_))
        ));
    }
}
