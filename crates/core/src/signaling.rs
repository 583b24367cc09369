//! One-shot WHEP/WHIP HTTP SDP exchange (spec.md §4.13).
//!
//! The retry-by-reconnecting-the-whole-session shape follows
//! `beam-agent::signaling`'s `run_signaling` outer loop, but the inner
//! exchange itself is a single `reqwest` POST rather than a long-lived
//! WebSocket — WHEP/WHIP signaling is one-shot by definition, so there is
//! no equivalent of the teacher's reconnect-within-session path here; the
//! reconnect loop lives one level up, in the pipeline driver.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, info};

use crate::error::SignalingError;
use crate::peer::PeerConnectionFacade;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Perform the one-shot exchange: create offer, wait for ICE gathering,
/// `POST` it to `url`, require `201 Created`, and apply the SDP answer.
///
/// Any non-201 response is fatal and its body is folded into the error
/// message verbatim (spec.md §4.13 step 6).
pub async fn exchange(
    peer: &PeerConnectionFacade,
    url: &str,
    http_timeout: Duration,
    ice_gather_timeout: Duration,
) -> Result<(), SignalingError> {
    let offer_sdp = peer.create_offer_and_gather(ice_gather_timeout).await?;

    debug!(bytes = offer_sdp.len(), "posting SDP offer");
    let client = reqwest::Client::builder()
        .timeout(http_timeout)
        .build()
        .map_err(SignalingError::Http)?;

    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, SDP_CONTENT_TYPE)
        .body(offer_sdp)
        .send()
        .await
        .map_err(SignalingError::Http)?;

    let status = response.status();
    if status != StatusCode::CREATED {
        let body = response.text().await.unwrap_or_default();
        return Err(SignalingError::UnexpectedStatus { status, body });
    }

    let answer_sdp = response.text().await.map_err(SignalingError::Http)?;
    info!(status = %status, bytes = answer_sdp.len(), "received SDP answer");

    peer.set_remote_answer(&answer_sdp).await?;
    Ok(())
}
