use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

/// Token claims minted by the external identity service. The server only
/// verifies; it never issues tokens in production.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub exp: usize,
}

#[derive(Clone)]
pub struct AuthKeys {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl AuthKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Handshake-time verification. Happens once per socket; there is no
    /// per-message re-authentication.
    pub fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| ApiError::new(ErrorCode::Unauthorized, format!("invalid token: {e}")))?;
        Ok(UserId(data.claims.sub))
    }

    /// Test-support issuer mirroring what the identity service produces.
    pub fn issue(&self, user_id: UserId, ttl_seconds: u64) -> Result<String, ApiError> {
        let exp = (chrono::Utc::now().timestamp() as u64 + ttl_seconds) as usize;
        encode(
            &Header::default(),
            &Claims {
                sub: user_id.0,
                exp,
            },
            &self.encoding,
        )
        .map_err(|e| ApiError::internal(format!("token encode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_token_and_rejects_garbage() {
        let keys = AuthKeys::from_secret("s3cret");
        let token = keys.issue(UserId(42), 60).expect("issue");
        assert_eq!(keys.verify(&token).expect("verify"), UserId(42));

        let err = keys.verify("not-a-token").expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let issuer = AuthKeys::from_secret("alpha");
        let verifier = AuthKeys::from_secret("beta");
        let token = issuer.issue(UserId(1), 60).expect("issue");
        let err = verifier.verify(&token).expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }
}
