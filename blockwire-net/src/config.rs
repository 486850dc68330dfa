//! The configuration, given from environment variables and lazy initialized when 
//! needed.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::env;

use once_cell::race::{OnceBool, OnceBox};


/// Return true if connections should be terminated on the first malformed frame, 
/// instead of dropping the frame and continuing.
/// 
/// To enable this feature, set `BLOCKWIRE_STRICT_PROTOCOL=1`.
pub fn strict_protocol() -> bool {
    static ENV: OnceBool = OnceBool::new();
    ENV.get_or_init(|| env_flag("BLOCKWIRE_STRICT_PROTOCOL", false))
}

/// Return true if block updates are propagated in the server world.
/// 
/// To disable this feature, set `BLOCKWIRE_BLOCK_UPDATES=0`.
pub fn block_updates() -> bool {
    static ENV: OnceBool = OnceBool::new();
    ENV.get_or_init(|| env_flag("BLOCKWIRE_BLOCK_UPDATES", true))
}

/// Directory of the server world's region files, `BLOCKWIRE_WORLD_DIR`, defaults to
/// `world/region`.
pub fn world_dir() -> &'static Path {
    static ENV: OnceBox<PathBuf> = OnceBox::new();
    ENV.get_or_init(|| {
        Box::new(env::var_os("BLOCKWIRE_WORLD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("world/region")))
    })
}

/// Address the server binds to, `BLOCKWIRE_BIND`, defaults to `127.0.0.1:25565`.
pub fn bind_addr() -> &'static str {
    static ENV: OnceBox<String> = OnceBox::new();
    ENV.get_or_init(|| {
        Box::new(env::var("BLOCKWIRE_BIND").unwrap_or_else(|_| "127.0.0.1:25565".to_string()))
    })
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var_os(name)
        .map(|s| s.as_encoded_bytes() == b"1")
        .unwrap_or(default)
}


/// Timings and policies of a connection loop.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between two heartbeats once spawned.
    pub heartbeat_interval: Duration,
    /// Maximum time spent waiting for and reading frames in a single loop iteration.
    pub read_budget: Duration,
    /// Maximum time a single write waits for the transport to accept bytes, a loop
    /// iteration never blocks longer than this on a peer that stopped reading.
    pub write_wait: Duration,
    /// Maximum time spent writing the disconnect frame when closing.
    pub close_timeout: Duration,
    /// Sleep at the end of each loop iteration.
    pub idle_sleep: Duration,
    /// Terminate the connection on the first malformed frame.
    pub strict: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            read_budget: Duration::from_millis(20),
            write_wait: Duration::from_millis(10),
            close_timeout: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(1),
            strict: strict_protocol(),
        }
    }
}
