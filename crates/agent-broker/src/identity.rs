use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;

const SECRET_BYTES: usize = 32;
const GATEWAY_TOKEN_PREFIX: &str = "gw_";
const NODE_SEED_PREFIX: &str = "seed_";

pub fn generate_gateway_token() -> String {
    random_secret(GATEWAY_TOKEN_PREFIX)
}

pub fn generate_node_seed() -> String {
    random_secret(NODE_SEED_PREFIX)
}

fn random_secret(prefix: &str) -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// DNS label for the instance route. Falls back to the instance ID when the
/// owner yields nothing usable.
pub fn route_hostname(owner: &str, instance_id: &str) -> String {
    let local = owner.split('@').next().unwrap_or_default();
    let label: String = local
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '.' | '_' => Some('-'),
            c if c.is_ascii_alphanumeric() || c == '-' => Some(c),
            _ => None,
        })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        instance_id.to_lowercase()
    } else {
        label.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct OriginatingUser {
    #[serde(default)]
    user_id: Option<String>,
}

/// Extracts the end user from an `X-Broker-API-Originating-Identity` value
/// (`<platform> <base64 json>`). Anything malformed yields `None`.
pub fn originating_user(header: &str) -> Option<String> {
    let mut parts = header.trim().splitn(2, ' ');
    let _platform = parts.next()?;
    let encoded = parts.next()?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let user: OriginatingUser = serde_json::from_slice(&decoded).ok()?;
    user.user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}
