//! Command-line configuration for the daemon.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Mount a conversation backend as a filesystem.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory to mount the filesystem at
    pub mountpoint: PathBuf,

    /// Base URL of the conversation backend
    pub backend_url: String,

    /// Age after which never-sent clones are garbage collected (e.g. 30s,
    /// 15m, 24h)
    #[arg(long, value_parser = parse_duration, default_value = "24h")]
    pub clone_timeout: Duration,

    /// TTL for cached backend reads; 0 disables caching
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub cache_ttl: Duration,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,
}

/// Parses `30`, `30s`, `15m` or `24h` into a duration.
fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => text.split_at(split),
        None => (text, "s"),
    };
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {text}"))?;
    let seconds = match unit.trim() {
        "" | "s" => count,
        "m" => count * 60,
        "h" => count * 3600,
        "d" => count * 86_400,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(Duration::from_secs(seconds))
}
