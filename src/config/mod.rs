use std::path::PathBuf;

use clap::Parser;

use crate::TssdResult;
use anyhow::anyhow;

/// Daemon settings. Every flag can also be supplied through its `TSS_*`
/// environment variable; command-line values win.
#[derive(Parser, Debug, Clone)]
#[command(name = "tssd", about = "A threshold signature scheme coordinator daemon")]
pub struct Settings {
    /// Root directory for key shares and logs
    #[arg(long, env = "TSS_HOME_ADDRESS", default_value = "./tssd-home")]
    pub home_address: String,

    /// Port the coordinator HTTP API listens on
    #[arg(long, short = 'p', env = "TSS_PORT", default_value_t = 4000)]
    pub port: u16,

    /// Base URL of the p2p relay
    #[arg(long, env = "TSS_P2P_URL", default_value = "http://localhost:8080")]
    pub p2p_url: String,

    /// Log level: debug, info, warn or error
    #[arg(long, env = "TSS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds the inbound dispatcher waits for an operation queue to appear
    #[arg(long, env = "TSS_MESSAGE_TIMEOUT", default_value_t = 60)]
    pub message_timeout: u64,

    /// Milliseconds between dispatcher retries while the queue is absent
    #[arg(long, env = "TSS_WRITE_MSG_RETRY_TIME", default_value_t = 500)]
    pub write_msg_retry_time: u64,

    /// Milliseconds the update task polls for party construction
    #[arg(long, env = "TSS_WAIT_IN_PARTY_MESSAGE_HANDLING", default_value_t = 100)]
    pub wait_in_party_message_handling: u64,
}

impl Settings {
    /// Absolute peer home, expanding `.` and `~` prefixes.
    pub fn peer_home(&self) -> TssdResult<PathBuf> {
        absolute_address(&self.home_address)
    }

    #[cfg(test)]
    pub fn for_tests(home: &str) -> Self {
        Settings {
            home_address: home.to_string(),
            port: 0,
            p2p_url: "http://localhost:8080".to_string(),
            log_level: "debug".to_string(),
            message_timeout: 5,
            write_msg_retry_time: 20,
            wait_in_party_message_handling: 10,
        }
    }
}

/// Resolves an address starting with `.`, `~` or `/` to an absolute path.
fn absolute_address(address: &str) -> TssdResult<PathBuf> {
    match address.chars().next() {
        Some('.') => Ok(std::env::current_dir()?.join(address)),
        Some('~') => {
            let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
            Ok(PathBuf::from(home).join(address.trim_start_matches(['~', '/'])))
        }
        Some('/') => Ok(PathBuf::from(address)),
        _ => Err(anyhow!("wrong address format: {}", address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_address_forms() {
        assert!(absolute_address("/var/tss").unwrap().starts_with("/var"));
        assert!(absolute_address("./home").unwrap().is_absolute());
        assert!(absolute_address("~/tss").unwrap().is_absolute());
        assert!(absolute_address("var/tss").is_err());
    }
}
