//! Per-runtime ES256 key pair and the access tokens it signs.
//!
//! The controller keeps the private half and issues tokens. The proxy
//! sidecar only receives the public half, so it can check tokens but never
//! mint them. The workspace a token grants access to travels in `aud`.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ALGORITHM: Algorithm = Algorithm::ES256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Token issued for another workspace")]
    WrongWorkspace,
    #[error("Token expired")]
    Expired,
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidAudience => Self::WrongWorkspace,
            ErrorKind::InvalidSignature => Self::BadSignature,
            _ => Self::Malformed,
        }
    }
}

fn invalid_key(e: impl std::fmt::Display) -> TokenError {
    TokenError::InvalidKey(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User the token was issued to
    pub sub: String,
    /// Workspace the token grants access to
    pub aud: String,
    pub iat: i64,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Token handed to a workspace owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Public half as mounted into the proxy sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyFile {
    pub key_id: String,
    /// SPKI PEM
    pub public_key: String,
}

/// Private half, stored in a Secret only the controller reads
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeyFile {
    pub key_id: String,
    /// PKCS#8 PEM
    pub private_key: String,
}

impl std::fmt::Debug for PrivateKeyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyFile")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    private_pem: String,
    encoding: EncodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    pub fn generate() -> Result<Self, TokenError> {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_pkcs8_pem(LineEnding::LF).map_err(invalid_key)?;
        Self::from_pem(uuid::Uuid::new_v4().to_string(), pem.as_str().to_owned())
    }

    fn from_pem(key_id: String, private_pem: String) -> Result<Self, TokenError> {
        let encoding = EncodingKey::from_ec_pem(private_pem.as_bytes()).map_err(invalid_key)?;
        Ok(Self {
            key_id,
            private_pem,
            encoding,
        })
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn to_private_key_file(&self) -> PrivateKeyFile {
        PrivateKeyFile {
            key_id: self.key_id.clone(),
            private_key: self.private_pem.clone(),
        }
    }

    pub fn from_private_key_file(file: &PrivateKeyFile) -> Result<Self, TokenError> {
        Self::from_pem(file.key_id.clone(), file.private_key.clone())
    }

    pub fn public_key_file(&self) -> Result<PublicKeyFile, TokenError> {
        let secret = p256::SecretKey::from_pkcs8_pem(&self.private_pem).map_err(invalid_key)?;
        let public_key = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(invalid_key)?;
        Ok(PublicKeyFile {
            key_id: self.key_id.clone(),
            public_key,
        })
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, TokenError> {
        VerifyingKey::from_public_key_file(&self.public_key_file()?)
    }

    /// Issue a token for `subject` on `workspace_id` valid for `ttl`
    pub fn issue(
        &self,
        subject: &str,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        Ok(self.access_token(subject, workspace_id, ttl)?.token)
    }

    pub fn access_token(
        &self,
        subject: &str,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<AccessToken, TokenError> {
        let now = Utc::now();
        let expires_at = now + ttl;
        let claims = Claims {
            sub: subject.to_string(),
            aud: workspace_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(self.key_id.clone());
        Ok(AccessToken {
            token: encode(&header, &claims, &self.encoding)?,
            expires_at,
        })
    }
}

/// Checks tokens against the public half of a runtime key
#[derive(Clone)]
pub struct VerifyingKey {
    key_id: String,
    decoding: DecodingKey,
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl VerifyingKey {
    pub fn from_public_key_file(file: &PublicKeyFile) -> Result<Self, TokenError> {
        let decoding = DecodingKey::from_ec_pem(file.public_key.as_bytes()).map_err(invalid_key)?;
        Ok(Self {
            key_id: file.key_id.clone(),
            decoding,
        })
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Check signature, expiry and that the token was issued for `workspace_id`
    pub fn verify(&self, token: &str, workspace_id: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.set_audience(&[workspace_id]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);
        Ok(decode::<Claims>(token, &self.decoding, &validation)?.claims)
    }
}
