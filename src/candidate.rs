//! ICE candidate descriptors and the per-round candidate queue.
//!
//! Candidates routinely arrive before the local engine has a remote
//! description to apply them against. They are buffered here in arrival
//! order and replayed once the remote description lands. A queue belongs to
//! exactly one negotiation round: replacing the engine discards the queue,
//! except across the accept-offer engine swap where the caller explicitly
//! carries the buffered candidates over to the fresh round.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Opaque connectivity hint for one possible network path between peers.
///
/// The candidate string follows RFC 5245; the core never interprets it
/// beyond well-formedness and the embedded `ufrag` extension attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateDescriptor {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    /// SDP media stream identification (e.g., "0" for audio)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

impl IceCandidateDescriptor {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_m_line_index: None,
            sdp_mid: None,
        }
    }

    /// Set the SDP media line index.
    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    /// Set the SDP media ID.
    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    /// The `ufrag` extension attribute embedded in the candidate string,
    /// if present. Ties the candidate to one negotiation round's ICE
    /// credentials.
    pub fn ufrag(&self) -> Option<&str> {
        let mut tokens = self.candidate.split_ascii_whitespace();
        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("ufrag") {
                return tokens.next();
            }
        }
        None
    }

    /// Validate against the ICE credentials of the current remote
    /// description. `remote_ufrag` is `None` when the engine has not
    /// surfaced credentials; only a definite mismatch rejects.
    pub fn validate(&self, remote_ufrag: Option<&str>) -> Result<(), CandidateRejection> {
        if self.candidate.trim().is_empty() {
            return Err(CandidateRejection::EmptyCandidate);
        }
        if let (Some(own), Some(remote)) = (self.ufrag(), remote_ufrag)
            && own != remote
        {
            return Err(CandidateRejection::UfragMismatch {
                candidate: own.to_string(),
                remote: remote.to_string(),
            });
        }
        Ok(())
    }
}

/// Why a descriptor was discarded instead of applied. Never fatal to the
/// call; one bad candidate does not abort a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateRejection {
    #[error("empty candidate string")]
    EmptyCandidate,

    #[error("candidate ufrag {candidate} does not match remote ufrag {remote}")]
    UfragMismatch { candidate: String, remote: String },
}

/// FIFO buffer for candidates that arrived ahead of the remote description.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    items: VecDeque<IceCandidateDescriptor>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: IceCandidateDescriptor) {
        self.items.push_back(descriptor);
    }

    /// Remove and return all buffered candidates in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidateDescriptor> {
        self.items.drain(..).collect()
    }

    /// Move the entire queue out, leaving this one empty. Used to carry
    /// buffered candidates across an engine replacement.
    pub fn take(&mut self) -> CandidateQueue {
        CandidateQueue {
            items: std::mem::take(&mut self.items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
