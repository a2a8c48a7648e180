pub mod signature;
pub mod token;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::AppResult;
use crate::identity::Identity;

pub use signature::{recover_permit_signer, to_checksum_address, PermitSigner};
pub use token::{peek_expiry, IssuedToken, TokenIssuer, VerificationClaims, TOKEN_TYPE};

/// Proof handed back for an accepted attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationCredential {
    pub identity: Identity,
    pub similarity_score: f64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: String,
    pub signature: Option<String>,
}

pub struct CredentialIssuer {
    tokens: TokenIssuer,
    signer: Option<PermitSigner>,
}

impl CredentialIssuer {
    pub fn new(tokens: TokenIssuer, signer: Option<PermitSigner>) -> Self {
        Self { tokens, signer }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn signer_address(&self) -> Option<String> {
        self.signer.as_ref().map(PermitSigner::checksum_address)
    }

    /// Mints the bearer token and, for address identities with a configured
    /// signer, the on-chain permit. A signing failure only drops the permit.
    pub fn issue(&self, identity: &Identity, similarity: f64) -> AppResult<VerificationCredential> {
        let issued = self.tokens.issue(identity, similarity)?;
        let signature = self.sign_permit(identity);

        Ok(VerificationCredential {
            identity: identity.clone(),
            similarity_score: similarity,
            issued_at: issued.issued_at,
            expires_at: issued.expires_at,
            token: issued.token,
            signature,
        })
    }

    fn sign_permit(&self, identity: &Identity) -> Option<String> {
        let signer = self.signer.as_ref()?;
        let address = identity.address_bytes()?;
        match signer.sign_address(&address) {
            Ok(signature) => {
                info!(identity = %identity.redacted(), "signed voting permit");
                Some(signature)
            }
            Err(err) => {
                warn!(identity = %identity.redacted(), error = %err, "permit signing failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn issuer(signer: Option<PermitSigner>) -> CredentialIssuer {
        let tokens = TokenIssuer::new(
            b"credential-test-secret-0123456789abcdef",
            "HS256",
            Duration::from_secs(600),
        )
        .unwrap();
        CredentialIssuer::new(tokens, signer)
    }

    #[test]
    fn address_identity_gets_recoverable_signature() {
        let signer = PermitSigner::random();
        let expected = signer.address();
        let credentials = issuer(Some(signer));
        let voter = Identity::parse("0x52908400098527886e0f7030069857d2e4169ee7").unwrap();

        let credential = credentials.issue(&voter, 0.91).unwrap();
        let signature = credential.signature.unwrap();
        let recovered =
            recover_permit_signer(&voter.address_bytes().unwrap(), &signature).unwrap();
        assert_eq!(recovered, expected);
        assert!(credentials.tokens().validate(&credential.token).is_some());
    }

    #[test]
    fn non_address_identity_gets_token_only() {
        let credentials = issuer(Some(PermitSigner::random()));
        let credential = credentials
            .issue(&Identity::parse("alice").unwrap(), 0.8)
            .unwrap();
        assert!(credential.signature.is_none());
        assert!(!credential.token.is_empty());
    }

    #[test]
    fn missing_signer_omits_signature() {
        let credentials = issuer(None);
        let voter = Identity::parse("0x52908400098527886e0f7030069857d2e4169ee7").unwrap();
        assert!(credentials.issue(&voter, 0.8).unwrap().signature.is_none());
        assert!(credentials.signer_address().is_none());
    }
}
