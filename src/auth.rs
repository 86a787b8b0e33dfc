//! Credential verification at the connection boundary.
//!
//! Verification is a black box to the session logic: a credential goes
//! in, a subject identity comes out. The shipped implementation is a
//! shared-secret scheme suitable for closed deployments; anything
//! heavier (JWT, mTLS identities) plugs in behind [`CredentialVerifier`].

use subtle::ConstantTimeEq;

use crate::session::SubjectId;

/// Fatal to the connection: no session logic runs after an auth failure,
/// and the server does not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credential missing or malformed")]
    Malformed,
    #[error("invalid credential")]
    Invalid,
}

/// Verified identity of the party on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectIdentity {
    pub subject_id: SubjectId,
}

/// Verify a presented credential. Called once per connection, before any
/// `start`/`fix` message is honored.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<SubjectIdentity, AuthError>;
}

/// Shared-secret verifier.
///
/// Credentials have the form `<subject-id>:<secret>`. The secret is
/// compared in constant time. When no secret is configured (development
/// mode), the credential is just the subject id and anything non-empty
/// authenticates, the same posture the HTTP side takes for
/// localhost-only binds.
pub struct SharedSecretVerifier {
    secret: Option<String>,
}

impl SharedSecretVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}

impl CredentialVerifier for SharedSecretVerifier {
    fn verify(&self, token: &str) -> Result<SubjectIdentity, AuthError> {
        let Some(expected) = &self.secret else {
            if token.is_empty() || token.contains(':') {
                return Err(AuthError::Malformed);
            }
            return Ok(SubjectIdentity {
                subject_id: token.to_string(),
            });
        };

        let (subject, secret) = token.split_once(':').ok_or(AuthError::Malformed)?;
        if subject.is_empty() {
            return Err(AuthError::Malformed);
        }
        if secret.as_bytes().ct_eq(expected.as_bytes()).into() {
            Ok(SubjectIdentity {
                subject_id: subject.to_string(),
            })
        } else {
            Err(AuthError::Invalid)
        }
    }
}
