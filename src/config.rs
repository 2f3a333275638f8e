//! Engine configuration.
//!
//! All limits default to the recommended values from the protocol's
//! resource model. Construct with [`EngineConfig::default`] and override
//! fields as needed; nothing here reads configuration files.

use std::time::Duration;

/// Default lane quota per tunnel.
pub const DEFAULT_MAX_LANES: usize = 1024;

/// Default credit granted to the peer when a lane opens.
pub const DEFAULT_INITIAL_CREDIT: u32 = 32;

/// Default queued-event cap per subscriber before disconnect.
pub const DEFAULT_MAX_INFLIGHT_PER_SUBSCRIBER: usize = 256;

/// Default maximum header-block size.
pub const DEFAULT_FRAME_HEADER_MAX: usize = 16 * 1024;

/// Default maximum non-chunked body size.
pub const DEFAULT_NON_CHUNKED_BODY_MAX: usize = 1024 * 1024;

/// Default cap on one chunked body's reassembly buffer.
pub const DEFAULT_REASSEMBLY_CAP: usize = 64 * 1024 * 1024;

/// Default retention window for resumable tunnel state.
pub const DEFAULT_RESUME_TTL: Duration = Duration::from_secs(60);

/// Default lane-0 keepalive interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Default forwarding hop limit.
pub const DEFAULT_HOP_LIMIT: u32 = 8;

/// Default `Idem:` dedupe window.
pub const DEFAULT_IDEM_TTL: Duration = Duration::from_secs(30);

/// Default nonce validity for the challenge fallback path.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(30);

/// Tunable limits and intervals for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrently open lanes per tunnel.
    pub max_lanes: usize,
    /// Credit granted to the peer when a lane is admitted.
    pub initial_credit: u32,
    /// Events queued per subscriber before the lane is dropped with `429`.
    pub max_inflight_per_subscriber: usize,
    /// Maximum size of one frame's header block.
    pub frame_header_max: usize,
    /// Maximum `Length:` body; larger content must be chunked.
    pub non_chunked_body_max: usize,
    /// Maximum buffered bytes while reassembling one chunked body.
    pub reassembly_cap: usize,
    /// How long lane state survives a transport loss.
    pub resume_ttl: Duration,
    /// Lane-0 idle interval before a `PING` is sent.
    pub heartbeat: Duration,
    /// Maximum delegation hops before `412 PRECONDITION`.
    pub hop_limit: u32,
    /// Dedupe window for the `Idem:` header.
    pub idem_ttl: Duration,
    /// Validity window for single-use challenge nonces.
    pub nonce_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_lanes: DEFAULT_MAX_LANES,
            initial_credit: DEFAULT_INITIAL_CREDIT,
            max_inflight_per_subscriber: DEFAULT_MAX_INFLIGHT_PER_SUBSCRIBER,
            frame_header_max: DEFAULT_FRAME_HEADER_MAX,
            non_chunked_body_max: DEFAULT_NON_CHUNKED_BODY_MAX,
            reassembly_cap: DEFAULT_REASSEMBLY_CAP,
            resume_ttl: DEFAULT_RESUME_TTL,
            heartbeat: DEFAULT_HEARTBEAT,
            hop_limit: DEFAULT_HOP_LIMIT,
            idem_ttl: DEFAULT_IDEM_TTL,
            nonce_ttl: DEFAULT_NONCE_TTL,
        }
    }
}
