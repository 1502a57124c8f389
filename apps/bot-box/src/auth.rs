use arena_proto::{BotId, BotRef};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("secret key is empty")]
    EmptySecret,
    #[error("failed to sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub public_key: String,
    pub sub: String,
}

/// Identity presented to the platform on every dial and in every per-bot payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub public_key: String,
    pub token: String,
}

impl Credentials {
    pub fn mint(public_key: &str, secret_key: &str) -> Result<Self, AuthError> {
        if secret_key.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let claims = Claims {
            public_key: public_key.to_owned(),
            sub: public_key.to_owned(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret_key.as_bytes()),
        )?;
        Ok(Self {
            public_key: public_key.to_owned(),
            token,
        })
    }

    pub fn bot_ref(&self, id: BotId) -> BotRef {
        BotRef {
            token: self.token.clone(),
            public_key: self.public_key.clone(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    #[test]
    fn minted_token_verifies_with_the_shared_secret() {
        let creds = Credentials::mint("pk-7", "hunter2").unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        let data = decode::<Claims>(
            &creds.token,
            &DecodingKey::from_secret(b"hunter2"),
            &validation,
        )
        .unwrap();
        assert_eq!(data.claims.public_key, "pk-7");
        assert_eq!(data.claims.sub, "pk-7");

        assert!(decode::<Claims>(
            &creds.token,
            &DecodingKey::from_secret(b"wrong"),
            &validation
        )
        .is_err());
    }

    #[test]
    fn bot_ref_embeds_identity() {
        let creds = Credentials {
            public_key: "pk".into(),
            token: "tok".into(),
        };
        let bot = creds.bot_ref(4);
        assert_eq!((bot.token.as_str(), bot.public_key.as_str(), bot.id), ("tok", "pk", 4));
        assert!(matches!(
            Credentials::mint("pk", ""),
            Err(AuthError::EmptySecret)
        ));
    }
}
