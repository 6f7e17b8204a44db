//! Side-channel status messages.
//!
//! A low-latency in-band channel runs parallel to the media tracks and
//! mirrors local mute/camera state to the peer without a signaling
//! round-trip. Messages are fire-and-forget JSON blobs; if the channel is
//! closed the local toggle still applies and the peer simply misses the
//! indicator until the channel reopens.

use serde::{Deserialize, Serialize};

/// Mute/camera indicator mirrored to the remote peer.
///
/// Wire format: `{"type":"MIC_STATUS","muted":true}` /
/// `{"type":"VIDEO_STATUS","videoOff":true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusMessage {
    #[serde(rename = "MIC_STATUS")]
    MicStatus { muted: bool },

    #[serde(rename = "VIDEO_STATUS")]
    VideoStatus {
        #[serde(rename = "videoOff")]
        off: bool,
    },
}

impl StatusMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
