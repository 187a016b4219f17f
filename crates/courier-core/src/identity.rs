use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use courier_types::api::Claims;

use crate::error::ChatError;

/// Verifies bearer tokens issued by the account service. Fails closed.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ChatError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Rejected credential: {}", e);
                ChatError::Unauthorized
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    fn token(secret: &str, exp: usize) -> String {
        let claims = Claims { sub: Uuid::new_v4(), username: "dana".into(), exp };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn accepts_valid_and_rejects_forged_or_expired() {
        let verifier = TokenVerifier::new("test-secret");
        let future = (chrono::Utc::now().timestamp() + 3600) as usize;

        assert_eq!(verifier.verify(&token("test-secret", future)).unwrap().username, "dana");
        assert!(matches!(verifier.verify(&token("other", future)), Err(ChatError::Unauthorized)));
        assert!(matches!(verifier.verify(&token("test-secret", 1)), Err(ChatError::Unauthorized)));
        assert!(matches!(verifier.verify("not-a-jwt"), Err(ChatError::Unauthorized)));
    }
}
