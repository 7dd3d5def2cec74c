//! The deferral protocol: handing a pending join to approvers.
//!
//! A deferral is a signed token whose payload carries the assignees
//! (`aud`, sorted), the target group (`grp`), the requesting user
//! (`usr`), and the serialized input values (`inp`, unset properties
//! omitted). The token travels out of band (email, chat); whoever
//! presents it back picks up the pending join and continues as an
//! approver.
//!
//! Signature or parse failures are `TokenVerification` errors and must
//! never be conflated with an authorization decision.

use crate::errors::{KairosError, Result};
use crate::join::JoinProposal;
use crate::policy::JitGroupId;
use crate::principal::UserId;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};
use tracing::instrument;

/// Wire payload of a deferral token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeferralPayload {
    /// Assignee user emails, sorted lexicographically.
    pub aud: Vec<String>,
    /// Canonical target group id.
    pub grp: String,
    /// The requesting user's email.
    pub usr: String,
    /// Input property values by name; unset values are omitted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inp: BTreeMap<String, String>,
}

/// A signed token and its expiry.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedToken {
    /// The encoded token.
    pub token: String,
    /// When the token stops verifying.
    pub expiry: OffsetDateTime,
}

/// Signs and verifies deferral payloads.
#[async_trait]
pub trait TokenSigner: Send + Sync {
    /// Signs a payload, returning the token and its expiry.
    async fn sign(&self, payload: &DeferralPayload) -> Result<SignedToken>;

    /// Verifies a token and returns its payload verbatim.
    async fn verify(&self, token: &str) -> Result<DeferralPayload>;
}

#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    payload: DeferralPayload,
    iat: i64,
    exp: i64,
}

/// HS256 token signer.
pub struct JwtTokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validity: Duration,
}

impl JwtTokenSigner {
    /// Creates a signer over a shared secret.
    pub fn new(secret: &[u8], validity: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validity,
        }
    }
}

#[async_trait]
impl TokenSigner for JwtTokenSigner {
    async fn sign(&self, payload: &DeferralPayload) -> Result<SignedToken> {
        let now = OffsetDateTime::now_utc();
        let expiry = now + self.validity;
        let claims = Claims {
            payload: payload.clone(),
            iat: now.unix_timestamp(),
            exp: expiry.unix_timestamp(),
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| KairosError::Internal(format!("cannot sign deferral token: {e}")))?;
        Ok(SignedToken { token, expiry })
    }

    async fn verify(&self, token: &str) -> Result<DeferralPayload> {
        let mut validation = Validation::new(Algorithm::HS256);
        // The aud claim carries user emails, checked at pickup rather
        // than against a fixed audience.
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| KairosError::TokenVerification(e.to_string()))?;
        Ok(data.claims.payload)
    }
}

/// A verified deferral, as seen by a prospective approver.
#[derive(Clone, Debug)]
pub struct Deferral {
    deferrer: UserId,
    assignees: Vec<UserId>,
    group: JitGroupId,
    input: BTreeMap<String, String>,
}

impl Deferral {
    /// The user whose join is pending.
    pub fn deferrer(&self) -> &UserId {
        &self.deferrer
    }

    /// The users allowed to pick the join up, sorted.
    pub fn assignees(&self) -> &[UserId] {
        &self.assignees
    }

    /// The target group.
    pub fn group(&self) -> &JitGroupId {
        &self.group
    }

    /// The deferred input values.
    pub fn input(&self) -> &BTreeMap<String, String> {
        &self.input
    }

    /// Whether a user is among the assignees.
    pub fn is_assignee(&self, user: &UserId) -> bool {
        self.assignees.contains(user)
    }
}

/// Encodes pending joins as tokens and decodes them back.
pub struct DeferralService<S> {
    signer: S,
}

impl<S: TokenSigner> DeferralService<S> {
    /// Creates a deferral service over a signer.
    pub fn new(signer: S) -> Self {
        Self { signer }
    }

    /// Encodes a validated join proposal for the given assignees.
    #[instrument(skip(self, proposal), fields(user = %proposal.user, group = %proposal.group))]
    pub async fn defer(
        &self,
        proposal: &JoinProposal,
        assignees: &[UserId],
    ) -> Result<SignedToken> {
        if assignees.is_empty() {
            return Err(KairosError::invalid_input(
                "assignees",
                "at least one assignee is required",
            ));
        }

        let mut aud: Vec<String> = assignees.iter().map(|u| u.email().to_string()).collect();
        aud.sort();
        aud.dedup();

        let payload = DeferralPayload {
            aud,
            grp: proposal.group.to_string(),
            usr: proposal.user.email().to_string(),
            inp: proposal.input.clone(),
        };
        self.signer.sign(&payload).await
    }

    /// Verifies a token and returns the deferral view.
    pub async fn pickup(&self, token: &str) -> Result<Deferral> {
        let payload = self.signer.verify(token).await?;

        let deferrer = UserId::new(&payload.usr)
            .map_err(|_| KairosError::TokenVerification("malformed usr claim".into()))?;
        let group: JitGroupId = payload
            .grp
            .parse()
            .map_err(|_| KairosError::TokenVerification("malformed grp claim".into()))?;
        let assignees = payload
            .aud
            .iter()
            .map(|email| {
                UserId::new(email)
                    .map_err(|_| KairosError::TokenVerification("malformed aud claim".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        if assignees.is_empty() {
            return Err(KairosError::TokenVerification("empty aud claim".into()));
        }

        Ok(Deferral {
            deferrer,
            assignees,
            group,
            input: payload.inp,
        })
    }
}
