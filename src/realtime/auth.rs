//! Channel authentication: a JWT carried as a query parameter on the
//! upgrade request, validated before the socket is accepted.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::policy::{ResourceOverride, Tier};

/// Claims embedded in the channel JWT. Besides identity, the token carries
/// everything C2 needs to build a `UserContext` — the User entity lives
/// outside this engine, so the issuing auth collaborator is the only party
/// that knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelClaims {
    pub user_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub resource_override: ResourceOverride,
    pub api_base_url: String,
    pub api_token: String,
    pub model: String,
    pub context_window: String,
    pub exp: usize,
    pub iat: usize,
}

pub fn validate_channel_token(token: &str, secret: &str) -> Result<ChannelClaims, &'static str> {
    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(secret.as_bytes());

    let data = decode::<ChannelClaims>(token, &key, &validation).map_err(|_| "invalid token")?;

    let now = chrono::Utc::now().timestamp() as usize;
    if data.claims.exp < now {
        return Err("token expired");
    }

    Ok(data.claims)
}
