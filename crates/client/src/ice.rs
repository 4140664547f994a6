use huddle_protocol::{IceConfig, ParticipantId, TurnCredentials};
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Assemble the ICE server list for new peer connections: the configured
/// STUN servers, plus TURN relays from either the credential endpoint or
/// static configuration.
///
/// The credential endpoint is best-effort. A fetch failure degrades to
/// STUN-only rather than blocking the join; direct paths still connect.
pub async fn gather_ice_servers(config: &IceConfig, user_id: ParticipantId) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();

    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }

    if let Some(url) = &config.credential_url {
        match fetch_turn_credentials(url, user_id).await {
            Ok(creds) if !creds.urls.is_empty() => {
                info!(relays = creds.urls.len(), "TURN credentials fetched");
                servers.push(RTCIceServer {
                    urls: creds.urls,
                    username: creds.username,
                    credential: creds.credential,
                });
            }
            Ok(_) => warn!("TURN credential endpoint returned no relay URLs"),
            Err(e) => warn!("TURN credential fetch failed, continuing with STUN only: {e:#}"),
        }
    } else if !config.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
        });
    }

    servers
}

/// The credential service mints a per-user username (`<ts>:user<id>`), so
/// the requester's id rides along as a query parameter.
fn credential_request_url(base: &str, user_id: ParticipantId) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}user_id={user_id}")
}

async fn fetch_turn_credentials(
    url: &str,
    user_id: ParticipantId,
) -> anyhow::Result<TurnCredentials> {
    let response = reqwest::Client::new()
        .get(credential_request_url(url, user_id))
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json::<TurnCredentials>().await?)
}
