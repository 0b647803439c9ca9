use crate::error::{Error, ErrorKind, Result};
use serde_derive::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

pub const KEY_CHUNK_SIZE: &str = "pcj.network.chunk.size";
pub const KEY_WORKERS_COUNT: &str = "pcj.network.workers.count";
pub const KEY_SHUTDOWN_TIMEOUT: &str = "pcj.network.shutdown.timeout";
pub const KEY_ALIVE_TIMEOUT: &str = "pcj.alive.timeout";

pub const DEFAULT_CHUNK_SIZE: usize = 16384;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Runtime tunables. Defaults apply unless overridden by a properties blob
/// (the launcher's `key=value` argument) or the runner's TOML config file.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    /// Wire chunk size for large payload streams, in bytes.
    pub chunk_size: usize,
    /// Number of message handler threads.
    pub workers_count: usize,
    /// Grace period for the shutdown ("bye") drain, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Peer liveness probe interval in seconds; 0 disables the probe.
    pub alive_timeout_secs: u64,
}

impl Default for Properties {
    fn default() -> Properties {
        Properties {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers_count: default_workers(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            alive_timeout_secs: 0,
        }
    }
}

fn default_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl Properties {
    /// Parses a properties blob of `key=value` pairs separated by semicolons
    /// or newlines, applying each pair on top of the current values.
    ///
    /// Unknown keys and unparsable values are configuration errors.
    pub fn apply_blob(&mut self, blob: &str) -> Result<()> {
        for entry in blob.split(|c| c == ';' || c == '\n') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let mut parts = entry.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim();
            let value = parts
                .next()
                .ok_or_else(|| {
                    Error::with_detail(ErrorKind::Config, format!("missing '=' in `{}`", entry))
                })?
                .trim();

            self.apply(key, value)?;
        }

        Ok(())
    }

    /// Applies a single property.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            KEY_CHUNK_SIZE => {
                self.chunk_size = parse(key, value)?;
                if self.chunk_size == 0 {
                    return Err(Error::with_detail(ErrorKind::Config, "chunk size must be > 0"));
                }
            }
            KEY_WORKERS_COUNT => {
                self.workers_count = parse(key, value)?;
                if self.workers_count == 0 {
                    return Err(Error::with_detail(ErrorKind::Config, "worker count must be > 0"));
                }
            }
            KEY_SHUTDOWN_TIMEOUT => self.shutdown_timeout_secs = parse(key, value)?,
            KEY_ALIVE_TIMEOUT => self.alive_timeout_secs = parse(key, value)?,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::Config,
                    format!("unknown property `{}`", key),
                ))
            }
        }

        Ok(())
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[inline]
    pub fn alive_timeout(&self) -> Option<Duration> {
        match self.alive_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::with_detail(ErrorKind::Config, format!("invalid value `{}` for `{}`", value, key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let props = Properties::default();

        assert_eq!(props.chunk_size, 16384);
        assert!(props.workers_count > 0);
        assert_eq!(props.shutdown_timeout_secs, 10);
        assert_eq!(props.alive_timeout(), None);
    }

    #[test]
    fn blob_overrides() {
        let mut props = Properties::default();
        props
            .apply_blob("pcj.network.chunk.size=1024; pcj.alive.timeout=5\npcj.network.workers.count=2")
            .unwrap();

        assert_eq!(props.chunk_size, 1024);
        assert_eq!(props.workers_count, 2);
        assert_eq!(props.alive_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn unknown_key_rejected() {
        let mut props = Properties::default();
        let err = props.apply_blob("pcj.bogus=1").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn malformed_value_rejected() {
        let mut props = Properties::default();
        let err = props.apply_blob("pcj.network.chunk.size=banana").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Config);

        let err = props.apply_blob("pcj.network.workers.count=0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
