//! Pre-flight HTTP health check. Advisory only: the result is logged and
//! never gates a connection attempt.

use tracing::{info, warn};
use url::Url;

use cloudlink_account::AccountDescriptor;
use cloudlink_protocol::constants::{DEVICE_CONNECT_PATH, HEALTH_PATH};

/// Derives the health URL from an account endpoint.
///
/// A trailing `/ws/device` becomes `/healthz`, an empty path becomes
/// `/healthz`, and any other path is kept. `wss`/`https` map to `https`,
/// everything else to `http`. Query and fragment are dropped.
pub fn health_url(endpoint: &str) -> Result<Url, url::ParseError> {
    let cloud = Url::parse(endpoint.trim())?;
    let scheme = match cloud.scheme() {
        "wss" | "https" => "https",
        _ => "http",
    };
    let host = cloud.host_str().unwrap_or_default();
    let authority = match cloud.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = match cloud.path() {
        "" | "/" => HEALTH_PATH.to_string(),
        p => match p.strip_suffix(DEVICE_CONNECT_PATH) {
            Some(prefix) => format!("{prefix}{HEALTH_PATH}"),
            None => p.to_string(),
        },
    };
    Url::parse(&format!("{scheme}://{authority}{path}"))
}

/// GETs the health URL with the account's probe timeout. Returns `true` on a
/// 2xx response.
pub async fn run_probe(client: &reqwest::Client, account: &AccountDescriptor) -> bool {
    let url = match health_url(&account.endpoint) {
        Ok(url) => url,
        Err(e) => {
            warn!(account = %account.id, error = %e, "probe failed: bad endpoint");
            return false;
        }
    };

    let result = client
        .get(url.as_str())
        .timeout(account.connect_probe_timeout())
        .send()
        .await;
    match result {
        Ok(resp) => {
            info!(
                account = %account.id,
                origin = %url.origin().ascii_serialization(),
                status = resp.status().as_u16(),
                "probe"
            );
            resp.status().is_success()
        }
        Err(e) => {
            warn!(account = %account.id, error = %e, "probe failed");
            false
        }
    }
}
