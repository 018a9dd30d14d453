//! I/O configuration file parsing.
//!
//! The disk calibration tool writes a small config consumed at startup.
//! Two formats are accepted:
//!
//! - plain properties: `max-io-requests=N` / `num-io-queues=M` lines,
//! - a shell env-file with a single
//!   `SEASTAR_IO="--max-io-requests=N --num-io-queues=M"` line.
//!
//! The default location is `$HOME/.config/<app>/io.conf`.

use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
    /// Upper bound on disk requests in flight, across all queues.
    pub max_io_requests: u32,
    /// Number of I/O queues sharing that bound. 0 means one per reactor.
    pub num_io_queues: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            max_io_requests: 128,
            num_io_queues: 0,
        }
    }
}

impl IoConfig {
    /// Default config file path for an application name.
    pub fn default_path(app: &str) -> PathBuf {
        let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
        PathBuf::from(home).join(".config").join(app).join("io.conf")
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<IoConfig, Error> {
        let text = std::fs::read_to_string(path).map_err(Error::from)?;
        IoConfig::parse(&text)
    }

    /// Parse either accepted format. Unknown keys are ignored; missing
    /// keys keep their defaults.
    pub fn parse(text: &str) -> Result<IoConfig, Error> {
        let mut cfg = IoConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("SEASTAR_IO=") {
                let flags = rest.trim_matches(|c| c == '"' || c == '\'');
                for flag in flags.split_whitespace() {
                    let flag = flag.trim_start_matches("--");
                    apply_key_value(&mut cfg, flag)?;
                }
            } else {
                apply_key_value(&mut cfg, line)?;
            }
        }
        Ok(cfg)
    }
}

fn apply_key_value(cfg: &mut IoConfig, kv: &str) -> Result<(), Error> {
    let Some((key, value)) = kv.split_once('=') else {
        return Err(Error::Config(
            format!("expected key=value, got {kv:?}").into(),
        ));
    };
    let parse = |value: &str| -> Result<u32, Error> {
        value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {key}: {value:?}").into()))
    };
    match key.trim() {
        "max-io-requests" => cfg.max_io_requests = parse(value)?,
        "num-io-queues" => cfg.num_io_queues = parse(value)?,
        _ => {}
    }
    Ok(())
}
