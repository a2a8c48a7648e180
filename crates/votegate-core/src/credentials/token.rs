use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::identity::Identity;

pub const TOKEN_TYPE: &str = "face_verification";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationClaims {
    pub sub: String,
    pub verified: bool,
    pub score: f64,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    expiry: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], algorithm: &str, expiry: std::time::Duration) -> AppResult<Self> {
        let algorithm = parse_algorithm(algorithm)?;
        let expiry = Duration::from_std(expiry)
            .map_err(|err| AppError::Token(format!("invalid token expiry: {err}")))?;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            algorithm,
            expiry,
        })
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn issue(&self, identity: &Identity, similarity: f64) -> AppResult<IssuedToken> {
        self.issue_at(identity, similarity, Utc::now())
    }

    pub fn issue_at(
        &self,
        identity: &Identity,
        similarity: f64,
        now: DateTime<Utc>,
    ) -> AppResult<IssuedToken> {
        let expires_at = now + self.expiry;
        let claims = VerificationClaims {
            sub: identity.as_str().to_string(),
            verified: true,
            score: (similarity * 10_000.0).round() / 10_000.0,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            token_type: TOKEN_TYPE.to_string(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|err| AppError::Token(err.to_string()))?;
        Ok(IssuedToken {
            token,
            issued_at: now,
            expires_at,
        })
    }

    /// `None` for any token that is not a live verification token signed with
    /// this key. The reason is only logged.
    pub fn validate(&self, token: &str) -> Option<VerificationClaims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = match decode::<VerificationClaims>(token, &self.decoding, &validation) {
            Ok(data) => data.claims,
            Err(err) => {
                warn!(error = %err, "rejected verification token");
                return None;
            }
        };

        if claims.token_type != TOKEN_TYPE || !claims.verified {
            warn!("rejected verification token: wrong type or unverified");
            return None;
        }
        Some(claims)
    }
}

/// Reads `exp` without checking the signature. Display use only.
pub fn peek_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    #[derive(Deserialize)]
    struct ExpiryOnly {
        exp: i64,
    }

    let data = decode::<ExpiryOnly>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    Utc.timestamp_opt(data.claims.exp, 0).single()
}

fn parse_algorithm(name: &str) -> AppResult<Algorithm> {
    let algorithm = Algorithm::from_str(&name.trim().to_uppercase())
        .map_err(|_| AppError::Token(format!("unknown token algorithm '{name}'")))?;
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(algorithm),
        other => Err(AppError::Token(format!(
            "token algorithm {other:?} needs an asymmetric key; use HS256, HS384 or HS512"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"an-hmac-secret-that-is-long-enough!!";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(SECRET, "HS256", std::time::Duration::from_secs(600)).unwrap()
    }

    fn voter() -> Identity {
        Identity::parse("0x52908400098527886e0f7030069857d2e4169ee7").unwrap()
    }

    #[test]
    fn issued_token_validates_with_expected_claims() {
        let issued = issuer().issue(&voter(), 0.873456789).unwrap();
        let claims = issuer().validate(&issued.token).unwrap();
        assert_eq!(claims.sub, voter().as_str());
        assert!(claims.verified);
        assert_eq!(claims.score, 0.8735);
        assert_eq!(claims.token_type, TOKEN_TYPE);
        assert_eq!(claims.exp - claims.iat, 600);
    }

    #[test]
    fn expired_token_is_rejected() {
        let past = Utc::now() - Duration::minutes(30);
        let issued = issuer().issue_at(&voter(), 0.9, past).unwrap();
        assert!(issuer().validate(&issued.token).is_none());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let other = TokenIssuer::new(
            b"a-completely-different-secret-value!",
            "HS256",
            std::time::Duration::from_secs(600),
        )
        .unwrap();
        let issued = other.issue(&voter(), 0.9).unwrap();
        assert!(issuer().validate(&issued.token).is_none());
    }

    #[test]
    fn wrong_type_tag_is_rejected() {
        let now = Utc::now();
        let claims = VerificationClaims {
            sub: voter().as_str().into(),
            verified: true,
            score: 0.9,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
            token_type: "session".into(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert!(issuer().validate(&token).is_none());
    }

    #[test]
    fn unverified_claim_is_rejected() {
        let now = Utc::now();
        let claims = VerificationClaims {
            sub: voter().as_str().into(),
            verified: false,
            score: 0.9,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
            token_type: TOKEN_TYPE.into(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert!(issuer().validate(&token).is_none());
    }

    #[test]
    fn algorithm_mismatch_is_rejected() {
        let hs512 =
            TokenIssuer::new(SECRET, "hs512", std::time::Duration::from_secs(600)).unwrap();
        let issued = hs512.issue(&voter(), 0.9).unwrap();
        assert!(hs512.validate(&issued.token).is_some());
        assert!(issuer().validate(&issued.token).is_none());
    }

    #[test]
    fn peek_expiry_ignores_signature_and_expiry() {
        let past = Utc::now() - Duration::minutes(30);
        let issued = issuer().issue_at(&voter(), 0.9, past).unwrap();
        let peeked = peek_expiry(&issued.token).unwrap();
        assert_eq!(peeked.timestamp(), issued.expires_at.timestamp());
        assert!(peek_expiry("not-a-token").is_none());
    }

    #[test]
    fn asymmetric_algorithms_are_refused() {
        assert!(TokenIssuer::new(SECRET, "RS256", std::time::Duration::from_secs(60)).is_err());
        assert!(TokenIssuer::new(SECRET, "nope", std::time::Duration::from_secs(60)).is_err());
    }
}
