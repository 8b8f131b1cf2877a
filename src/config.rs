use clap::Parser;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

pub const HOST: &str = "127.0.0.1";
pub const PORT: u16 = 6379;
pub const BACKLOG: u32 = 1024;

/// Server settings, read from the command line with environment variable fallbacks.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "resplite", version, about)]
pub struct Config {
    /// The address to bind to
    #[arg(long, env = "RESPLITE_HOST", default_value = HOST)]
    pub host: String,

    /// The port to listen on
    #[arg(short, long, env = "RESPLITE_PORT", default_value_t = PORT)]
    pub port: u16,

    /// Maximum number of pending connections
    #[arg(long, env = "RESPLITE_BACKLOG", default_value_t = BACKLOG)]
    pub backlog: u32,

    /// Largest request, in bytes, a client may send
    #[arg(long, env = "RESPLITE_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "RESPLITE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HOST.to_string(),
            port: PORT,
            backlog: BACKLOG,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_command_line() {
        let config = Config::try_parse_from(["resplite"]).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn parse_arguments() {
        let config = Config::try_parse_from([
            "resplite",
            "--host",
            "0.0.0.0",
            "-p",
            "7000",
            "--backlog",
            "16",
            "--max-frame-size",
            "1024",
        ])
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7000);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.max_frame_size, 1024);
    }

    #[test]
    fn reject_invalid_port() {
        assert!(Config::try_parse_from(["resplite", "--port", "http"]).is_err());
    }
}
