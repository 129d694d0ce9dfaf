//! Configuration system.
//!
//! Loads network configuration from JSON strings (file IO left to app) and
//! projects it onto the reactor and Mux component configs.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    mux::{ErrorPolicy, MuxConfig},
    reactor::ReactorConfig,
};

/// Which host `--addr` overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFlag {
    /// Listeners bind to it.
    Bind,
    /// The client dials it.
    Dial,
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Host the client dials.
    #[serde(default = "default_server_host")]
    pub server_host: String,
    /// Port the server listens on and the client dials.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address listeners bind to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Largest accepted stream message, in bytes.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default)]
    pub protocol_errors: ErrorPolicy,
    #[serde(default)]
    pub strict_updates: bool,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tick_hz() -> u32 {
    64
}

fn default_max_frame_len() -> usize {
    1024 * 1024
}

fn default_read_chunk() -> usize {
    8 * 1024
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            port: default_port(),
            bind_host: default_bind_host(),
            tick_hz: default_tick_hz(),
            max_frame_len: default_max_frame_len(),
            read_chunk: default_read_chunk(),
            protocol_errors: ErrorPolicy::default(),
            strict_updates: false,
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Builds the config from command-line arguments (program name
    /// excluded). `--config <file>` is loaded first, then `--addr`, `--port`
    /// and `--tick-hz` override it. Unknown arguments are ignored.
    pub fn from_args(args: &[String], addr: AddrFlag) -> anyhow::Result<Self> {
        let mut cfg = match args.iter().position(|a| a == "--config") {
            Some(i) => {
                let path = flag_value(args, i)?;
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {path}"))?;
                Self::from_json_str(&text).with_context(|| format!("parse config {path}"))?
            }
            None => Self::default(),
        };
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {}
                "--addr" => match addr {
                    AddrFlag::Bind => cfg.bind_host = flag_value(args, i)?.to_string(),
                    AddrFlag::Dial => cfg.server_host = flag_value(args, i)?.to_string(),
                },
                "--port" => {
                    let value = flag_value(args, i)?;
                    cfg.port = value
                        .parse()
                        .with_context(|| format!("invalid --port {value:?}"))?;
                }
                "--tick-hz" => {
                    let value = flag_value(args, i)?;
                    cfg.tick_hz = value
                        .parse()
                        .with_context(|| format!("invalid --tick-hz {value:?}"))?;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        Ok(cfg)
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            bind_host: self.bind_host.clone(),
            max_frame_len: self.max_frame_len,
            read_chunk: self.read_chunk,
        }
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            protocol_errors: self.protocol_errors,
            strict_updates: self.strict_updates,
        }
    }

    /// Tick period derived from `tick_hz` (at least one tick per second).
    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }
}

fn flag_value(args: &[String], i: usize) -> anyhow::Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .with_context(|| format!("{} needs a value", args[i]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn empty_object_yields_defaults() {
        let config = NetConfig::from_json_str("{}").unwrap();
        assert_eq!(config, NetConfig::default());
        assert_eq!(config.port, 7000);
        assert_eq!(config.protocol_errors, ErrorPolicy::LogAndDrop);
        assert!(!config.strict_updates);
    }

    #[test]
    fn fields_override_and_project() {
        let config = NetConfig::from_json_str(
            r#"{ "port": 9000, "max_frame_len": 4096, "protocol_errors": "fatal", "strict_updates": true }"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.reactor_config().max_frame_len, 4096);
        assert_eq!(config.reactor_config().bind_host, "0.0.0.0");
        assert_eq!(
            config.mux_config(),
            MuxConfig {
                protocol_errors: ErrorPolicy::Fatal,
                strict_updates: true,
            }
        );
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(NetConfig::from_json_str(r#"{ "protocol_errors": "panic" }"#).is_err());
    }

    #[test]
    fn tick_period_follows_rate() {
        let config = NetConfig {
            tick_hz: 50,
            ..Default::default()
        };
        assert_eq!(config.tick_period(), std::time::Duration::from_millis(20));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = NetConfig::from_args(&args("--addr 10.0.0.1 --port 9000 --tick-hz 30"), AddrFlag::Dial)
            .unwrap();
        assert_eq!(cfg.server_host, "10.0.0.1");
        assert_eq!(cfg.bind_host, "0.0.0.0");
        assert_eq!((cfg.port, cfg.tick_hz), (9000, 30));

        let cfg = NetConfig::from_args(&args("-v --addr 127.0.0.1"), AddrFlag::Bind).unwrap();
        assert_eq!(cfg.bind_host, "127.0.0.1");
        assert_eq!(cfg.port, 7000);
    }

    #[test]
    fn malformed_flags_are_errors() {
        for line in ["--port seventy", "--port 70000", "--tick-hz -1", "--port"] {
            let err = NetConfig::from_args(&args(line), AddrFlag::Bind).unwrap_err();
            assert!(err.to_string().contains(args(line)[0].as_str()), "{line}: {err}");
        }
        assert!(NetConfig::from_args(&args("--config /nonexistent/net.json"), AddrFlag::Bind).is_err());
    }
}
