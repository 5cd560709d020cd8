//! Signed, expiring access tokens.
//!
//! A token is rendered as a flat JSON document suitable for a QR payload:
//!
//! ```json
//! {"kind":"pickup","sub":"<user>","order_id":"…","parcel_automat_id":"…",
//!  "cell_ids":["…"],"iat":1700000000,"exp":1700086400,"signature":"…"}
//! ```
//!
//! The signature is HMAC-SHA256 over `kind:sub:<attributes>:iat:exp`, base64
//! (standard alphabet) encoded.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use skyport_core::{AutomatId, CellId, OrderId, UserId};

type HmacSha256 = Hmac<Sha256>;

const KIND_IDENTITY: &str = "identity";
const KIND_PICKUP: &str = "pickup";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("token lifetime out of range")]
    TtlOutOfRange,
}

/// What a token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claims {
    /// Long-lived login token of a user.
    Identity {
        user_id: UserId,
        email: String,
        name: String,
    },
    /// Release of the cells holding one delivered order.
    Pickup {
        user_id: UserId,
        order_id: OrderId,
        parcel_automat_id: AutomatId,
        cell_ids: Vec<CellId>,
    },
}

impl Claims {
    pub fn kind(&self) -> &'static str {
        match self {
            Claims::Identity { .. } => KIND_IDENTITY,
            Claims::Pickup { .. } => KIND_PICKUP,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            Claims::Identity { user_id, .. } | Claims::Pickup { user_id, .. } => *user_id,
        }
    }

    fn attributes(&self) -> Vec<String> {
        match self {
            Claims::Identity { email, name, .. } => vec![email.clone(), name.clone()],
            Claims::Pickup {
                order_id,
                parcel_automat_id,
                cell_ids,
                ..
            } => {
                let cells: Vec<String> = cell_ids.iter().map(ToString::to_string).collect();
                vec![
                    order_id.to_string(),
                    parcel_automat_id.to_string(),
                    cells.join(","),
                ]
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    kind: String,
    sub: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_id: Option<OrderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parcel_automat_id: Option<AutomatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cell_ids: Option<Vec<CellId>>,
    iat: i64,
    exp: i64,
    signature: String,
}

impl Document {
    fn claims(&self) -> Result<Claims, TokenError> {
        let missing = |field: &str| TokenError::Malformed(format!("missing field `{field}`"));

        match self.kind.as_str() {
            KIND_IDENTITY => Ok(Claims::Identity {
                user_id: self.sub,
                email: self.email.clone().ok_or_else(|| missing("email"))?,
                name: self.name.clone().ok_or_else(|| missing("name"))?,
            }),
            KIND_PICKUP => Ok(Claims::Pickup {
                user_id: self.sub,
                order_id: self.order_id.ok_or_else(|| missing("order_id"))?,
                parcel_automat_id: self
                    .parcel_automat_id
                    .ok_or_else(|| missing("parcel_automat_id"))?,
                cell_ids: self.cell_ids.clone().ok_or_else(|| missing("cell_ids"))?,
            }),
            other => Err(TokenError::Malformed(format!("unknown kind '{other}'"))),
        }
    }

    fn from_claims(claims: &Claims, iat: i64, exp: i64, signature: String) -> Self {
        let mut doc = Document {
            kind: claims.kind().to_string(),
            sub: claims.user_id(),
            email: None,
            name: None,
            order_id: None,
            parcel_automat_id: None,
            cell_ids: None,
            iat,
            exp,
            signature,
        };

        match claims {
            Claims::Identity { email, name, .. } => {
                doc.email = Some(email.clone());
                doc.name = Some(name.clone());
            }
            Claims::Pickup {
                order_id,
                parcel_automat_id,
                cell_ids,
                ..
            } => {
                doc.order_id = Some(*order_id);
                doc.parcel_automat_id = Some(*parcel_automat_id);
                doc.cell_ids = Some(cell_ids.clone());
            }
        }

        doc
    }
}

/// A freshly signed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub claims: Claims,
    /// Base64 signature, the short form of the token.
    pub token: String,
    /// Full JSON document handed to the bearer.
    pub rendering: String,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Claims of a token that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    pub claims: Claims,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Issues and verifies tokens with one deployment-wide secret.
pub struct TokenAuthority {
    key: Box<[u8]>,
    identity_ttl: Duration,
    pickup_ttl: Duration,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("identity_ttl", &self.identity_ttl)
            .field("pickup_ttl", &self.pickup_ttl)
            .finish_non_exhaustive()
    }
}

fn canonical(kind: &str, sub: UserId, attributes: &[String], iat: i64, exp: i64) -> String {
    let mut parts = Vec::with_capacity(attributes.len() + 4);
    parts.push(kind.to_string());
    parts.push(sub.to_string());
    parts.extend(attributes.iter().cloned());
    parts.push(iat.to_string());
    parts.push(exp.to_string());
    parts.join(":")
}

fn timestamp(secs: i64) -> Result<Timestamp, TokenError> {
    Timestamp::from_second(secs).map_err(|_| TokenError::TtlOutOfRange)
}

impl TokenAuthority {
    pub fn new(
        secret: impl AsRef<[u8]>,
        identity_ttl: Duration,
        pickup_ttl: Duration,
    ) -> Result<Self, TokenError> {
        let key = secret.as_ref();
        if key.is_empty() {
            return Err(TokenError::EmptySecret);
        }

        Ok(Self {
            key: key.into(),
            identity_ttl,
            pickup_ttl,
        })
    }

    pub fn identity_ttl(&self) -> Duration {
        self.identity_ttl
    }

    pub fn pickup_ttl(&self) -> Duration {
        self.pickup_ttl
    }

    fn mac(&self, message: &str) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| TokenError::EmptySecret)?;
        mac.update(message.as_bytes());
        Ok(mac)
    }

    /// Sign `claims` for the given validity window. Used both for new tokens
    /// and to re-render a stored identity token.
    pub fn sign(
        &self,
        claims: Claims,
        issued_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<IssuedToken, TokenError> {
        let iat = issued_at.as_second();
        let exp = expires_at.as_second();
        let message = canonical(claims.kind(), claims.user_id(), &claims.attributes(), iat, exp);
        let signature = STANDARD.encode(self.mac(&message)?.finalize().into_bytes());

        let doc = Document::from_claims(&claims, iat, exp, signature.clone());
        let rendering =
            serde_json::to_string(&doc).map_err(|e| TokenError::Malformed(e.to_string()))?;

        Ok(IssuedToken {
            claims,
            token: signature,
            rendering,
            issued_at: timestamp(iat)?,
            expires_at: timestamp(exp)?,
        })
    }

    /// Issue a token with the lifetime configured for its kind.
    pub fn issue(&self, claims: Claims) -> Result<IssuedToken, TokenError> {
        self.issue_at(claims, Timestamp::now())
    }

    pub fn issue_at(&self, claims: Claims, now: Timestamp) -> Result<IssuedToken, TokenError> {
        let ttl = match claims {
            Claims::Identity { .. } => self.identity_ttl,
            Claims::Pickup { .. } => self.pickup_ttl,
        };
        let ttl = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::TtlOutOfRange)?;
        let iat = now.as_second();
        let exp = iat.checked_add(ttl).ok_or(TokenError::TtlOutOfRange)?;

        self.sign(claims, timestamp(iat)?, timestamp(exp)?)
    }

    /// Issuing again is the only refresh; earlier tokens stay valid until they expire.
    pub fn refresh(&self, claims: Claims) -> Result<IssuedToken, TokenError> {
        self.issue(claims)
    }

    pub fn validate(&self, rendering: &str) -> Result<ValidatedToken, TokenError> {
        self.validate_at(rendering, Timestamp::now())
    }

    /// Verify the signature, then the expiry.
    pub fn validate_at(&self, rendering: &str, now: Timestamp) -> Result<ValidatedToken, TokenError> {
        let doc: Document = serde_json::from_str(rendering.trim())
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        let claims = doc.claims()?;

        let signature = STANDARD
            .decode(doc.signature.as_bytes())
            .map_err(|_| TokenError::InvalidSignature)?;
        let message = canonical(&doc.kind, doc.sub, &claims.attributes(), doc.iat, doc.exp);
        self.mac(&message)?
            .verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        if now.as_second() > doc.exp {
            return Err(TokenError::Expired);
        }

        Ok(ValidatedToken {
            claims,
            issued_at: timestamp(doc.iat).map_err(|_| TokenError::Malformed("iat".into()))?,
            expires_at: timestamp(doc.exp).map_err(|_| TokenError::Malformed("exp".into()))?,
        })
    }
}
