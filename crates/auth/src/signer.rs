//! Connection URL signing.
//!
//! ```text
//! key = SHA-256(device_secret)
//! sig = base64url_nopad(HMAC-SHA256(key, "{deviceId}.{channelId}.{ts}"))
//! url = normalize(endpoint) + ?deviceId=..&channelId=..&ts=..&sig=..
//! ```

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use cloudlink_protocol::constants::DEVICE_CONNECT_PATH;

type HmacSha256 = Hmac<Sha256>;

const PARAM_DEVICE_ID: &str = "deviceId";
const PARAM_CHANNEL_ID: &str = "channelId";
const PARAM_TS: &str = "ts";
const PARAM_SIG: &str = "sig";

const SIGNED_PARAMS: [&str; 4] = [PARAM_DEVICE_ID, PARAM_CHANNEL_ID, PARAM_TS, PARAM_SIG];

/// Errors produced while building a signed URL.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid HMAC key: {0}")]
    InvalidKey(#[from] hmac::digest::InvalidLength),
}

/// Upgrades `http`/`https` to `ws`/`wss` and defaults an empty path.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, SignError> {
    let mut url = Url::parse(endpoint.trim())?;
    let upgraded = match url.scheme() {
        "https" => Some("wss"),
        "http" => Some("ws"),
        "ws" | "wss" => None,
        other => return Err(SignError::UnsupportedScheme(other.to_string())),
    };
    if let Some(scheme) = upgraded {
        url.set_scheme(scheme)
            .map_err(|_| SignError::UnsupportedScheme(url.scheme().to_string()))?;
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEVICE_CONNECT_PATH);
    }
    Ok(url)
}

fn signing_input(device_id: &str, channel_id: &str, ts: i64) -> String {
    format!("{device_id}.{channel_id}.{ts}")
}

fn mac_for(
    device_id: &str,
    channel_id: &str,
    ts: i64,
    device_secret: &str,
) -> Result<HmacSha256, SignError> {
    let key = Sha256::digest(device_secret.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key)?;
    mac.update(signing_input(device_id, channel_id, ts).as_bytes());
    Ok(mac)
}

/// Computes the URL-safe, unpadded signature for one connection attempt.
pub fn signature(
    device_id: &str,
    channel_id: &str,
    ts: i64,
    device_secret: &str,
) -> Result<String, SignError> {
    let mac = mac_for(device_id, channel_id, ts, device_secret)?;
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Checks a signature in constant time. Malformed input is `false`.
pub fn verify_signature(
    device_id: &str,
    channel_id: &str,
    ts: i64,
    device_secret: &str,
    sig: &str,
) -> bool {
    let Ok(raw) = URL_SAFE_NO_PAD.decode(sig.trim_end_matches('=')) else {
        return false;
    };
    match mac_for(device_id, channel_id, ts, device_secret) {
        Ok(mac) => mac.verify_slice(&raw).is_ok(),
        Err(_) => false,
    }
}

/// Builds a signed URL stamped with the current time.
pub fn signed_connection_url(
    endpoint: &str,
    device_id: &str,
    device_secret: &str,
    channel_id: &str,
) -> Result<Url, SignError> {
    signed_connection_url_at(
        endpoint,
        device_id,
        device_secret,
        channel_id,
        cloudlink_protocol::envelope::now_millis(),
    )
}

/// Builds a signed URL for an explicit millisecond timestamp.
///
/// Existing query parameters are kept unless they collide with the four
/// signed ones, which are replaced.
pub fn signed_connection_url_at(
    endpoint: &str,
    device_id: &str,
    device_secret: &str,
    channel_id: &str,
    ts: i64,
) -> Result<Url, SignError> {
    let mut url = normalize_endpoint(endpoint)?;
    let sig = signature(device_id, channel_id, ts, device_secret)?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !SIGNED_PARAMS.contains(&&**k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query.extend_pairs(kept);
        query
            .append_pair(PARAM_DEVICE_ID, device_id)
            .append_pair(PARAM_CHANNEL_ID, channel_id)
            .append_pair(PARAM_TS, &ts.to_string())
            .append_pair(PARAM_SIG, sig.as_str());
    }
    Ok(url)
}

/// Replaces the `sig` query value with `REDACTED` for logging.
pub fn redact_signature(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == PARAM_SIG) {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == PARAM_SIG {
                "REDACTED".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.query_pairs_mut().extend_pairs(pairs);
    redacted.to_string()
}
