//! Runtime configuration, read from the environment with sane defaults.
//!
//! Deliberately not a CLI-flag parser: the server is meant to run behind a
//! process manager or container orchestrator that sets environment
//! variables, not to be invoked interactively.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_UPLOAD_DIR: &str = "./uploads";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub upload_dir: PathBuf,
}

impl Config {
    /// Read `HOST`, `PORT` and `UPLOAD_DIR` from the environment, falling
    /// back to the documented defaults. Malformed values fall back rather
    /// than aborting startup, since a typo'd port shouldn't take the
    /// process down before `tracing` has even been initialized.
    pub fn from_env() -> Self {
        let host: IpAddr = std::env::var("HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| DEFAULT_HOST.parse().unwrap());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR));

        Self {
            bind_addr: SocketAddr::new(host, port),
            upload_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(DEFAULT_HOST, "0.0.0.0");
        assert_eq!(DEFAULT_PORT, 3001);
        assert_eq!(DEFAULT_UPLOAD_DIR, "./uploads");
    }
}
