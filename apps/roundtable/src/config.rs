//! Configuration surface: CLI flags over an optional JSON file over
//! defaults, validated before any subsystem starts.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use roundtable_codec::{parse_codec_list, CodecDescriptor, FrameDuration};

pub const DEFAULT_LOCAL_PORT: u16 = 1066;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CODECS: [&str; 4] = [
    "Opus48000Mono",
    "Opus24000Mono",
    "Opus48000Stereo",
    "Opus24000Stereo",
];

#[derive(Debug, Parser)]
#[command(name = "roundtable", about = "Peer-to-peer voice conferencing")]
pub struct Cli {
    /// JSON configuration file; flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// One of none, error, warn, info, debug.
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log file path; stdout when omitted.
    #[arg(long)]
    pub logfile: Option<String>,

    /// ICE server, repeatable; at least one is required.
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    #[arg(long)]
    pub localport: Option<u16>,

    /// Rendezvous base URL, required.
    #[arg(long)]
    pub signallingserver: Option<String>,

    /// Rendezvous round-trip timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Ordered codec preference, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub codecs: Vec<String>,

    /// Opus frame duration in milliseconds.
    #[arg(long = "opus-frame-duration")]
    pub opus_frame_duration: Option<f64>,

    #[arg(long = "opus-buffer-safety-factor")]
    pub opus_buffer_safety_factor: Option<usize>,

    /// Public address advertised in the shared identifier.
    #[arg(long = "public-ip")]
    pub public_ip: Option<String>,

    /// Peer identifier to dial at startup.
    #[arg(long)]
    pub dial: Option<String>,

    /// Capture device name; system default when omitted.
    #[arg(long = "input-device")]
    pub input_device: Option<String>,

    /// Playback device name; system default when omitted.
    #[arg(long = "output-device")]
    pub output_device: Option<String>,

    /// List audio devices and exit.
    #[arg(long = "list-devices")]
    pub list_devices: bool,
}

/// JSON file keys mirror the documented configuration surface.
#[derive(Debug, Default, serde::Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub loglevel: Option<String>,
    #[serde(default)]
    pub logfile: Option<String>,
    #[serde(default, rename = "ICEServers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub localport: Option<u16>,
    #[serde(default)]
    pub signallingserver: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub codecs: Vec<String>,
    #[serde(default, rename = "OPUSFrameDuration")]
    pub opus_frame_duration: Option<f64>,
    #[serde(default, rename = "OPUSBufferSafetyFactor")]
    pub opus_buffer_safety_factor: Option<usize>,
    #[serde(default, rename = "PublicIP")]
    pub public_ip: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "none" => Ok(Self::None),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(ConfigError(format!("unknown loglevel: {other}"))),
        }
    }

    pub fn filter(&self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// The validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub loglevel: LogLevel,
    pub logfile: Option<String>,
    pub ice_servers: Vec<String>,
    pub localport: u16,
    pub signalling_server: String,
    pub timeout: Duration,
    pub codecs: Vec<CodecDescriptor>,
    pub frame_duration: FrameDuration,
    pub safety_factor: usize,
    pub public_ip: String,
}

impl Config {
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
                serde_json::from_str::<FileConfig>(&raw)
                    .map_err(|e| ConfigError(format!("cannot parse {}: {e}", path.display())))?
            }
            None => FileConfig::default(),
        };

        let loglevel = LogLevel::parse(
            cli.loglevel
                .as_deref()
                .or(file.loglevel.as_deref())
                .unwrap_or("info"),
        )?;

        let logfile = cli
            .logfile
            .clone()
            .or(file.logfile)
            .filter(|p| !p.is_empty());

        let ice_servers = if !cli.ice_servers.is_empty() {
            cli.ice_servers.clone()
        } else {
            file.ice_servers
        };
        if ice_servers.is_empty() {
            return Err(ConfigError("at least one ICE server is required".to_string()));
        }

        let signalling_server = cli
            .signallingserver
            .clone()
            .or(file.signallingserver)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError("signallingserver is required".to_string()))?;

        let localport = cli.localport.or(file.localport).unwrap_or(DEFAULT_LOCAL_PORT);
        let timeout = Duration::from_secs(
            cli.timeout
                .or(file.timeout)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        let codec_names: Vec<String> = if !cli.codecs.is_empty() {
            cli.codecs.clone()
        } else if !file.codecs.is_empty() {
            file.codecs
        } else {
            DEFAULT_CODECS.iter().map(|s| s.to_string()).collect()
        };
        let codecs =
            parse_codec_list(&codec_names).map_err(|e| ConfigError(e.to_string()))?;

        let frame_duration = FrameDuration::from_millis(
            cli.opus_frame_duration
                .or(file.opus_frame_duration)
                .unwrap_or(20.0),
        )
        .map_err(|e| ConfigError(e.to_string()))?;

        let safety_factor = cli
            .opus_buffer_safety_factor
            .or(file.opus_buffer_safety_factor)
            .unwrap_or(roundtable_codec::DEFAULT_SAFETY_FACTOR);
        if safety_factor == 0 {
            return Err(ConfigError(
                "OPUSBufferSafetyFactor must be positive".to_string(),
            ));
        }

        let public_ip = cli
            .public_ip
            .clone()
            .or(file.public_ip)
            .unwrap_or_else(|| format!("127.0.0.1:{localport}"));

        Ok(Self {
            loglevel,
            logfile,
            ice_servers,
            localport,
            signalling_server,
            timeout,
            codecs,
            frame_duration,
            safety_factor,
            public_ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("roundtable").chain(args.iter().copied()))
    }

    #[test]
    fn test_minimal_valid_config_uses_defaults() {
        let config = Config::resolve(&cli(&[
            "--ice-server",
            "stun:stun.example.org:3478",
            "--signallingserver",
            "https://rendezvous.example.org",
        ]))
        .unwrap();

        assert_eq!(config.localport, 1066);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.safety_factor, 16);
        assert_eq!(config.frame_duration, FrameDuration::Ms20);
        assert_eq!(config.loglevel, LogLevel::Info);
        assert_eq!(config.codecs.len(), 4);
        assert_eq!(config.codecs[0].name(), "Opus48000Mono");
    }

    #[test]
    fn test_missing_ice_servers_rejected() {
        let err = Config::resolve(&cli(&["--signallingserver", "https://r.example.org"]))
            .unwrap_err();
        assert!(err.to_string().contains("ICE"));
    }

    #[test]
    fn test_missing_signalling_server_rejected() {
        assert!(Config::resolve(&cli(&["--ice-server", "stun:s.example.org"])).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = [
            "--ice-server",
            "stun:s.example.org",
            "--signallingserver",
            "https://r.example.org",
        ];
        let mut args = base.to_vec();
        args.extend(["--loglevel", "verbose"]);
        assert!(Config::resolve(&cli(&args)).is_err());

        let mut args = base.to_vec();
        args.extend(["--opus-frame-duration", "15"]);
        assert!(Config::resolve(&cli(&args)).is_err());

        let mut args = base.to_vec();
        args.extend(["--opus-buffer-safety-factor", "0"]);
        assert!(Config::resolve(&cli(&args)).is_err());

        let mut args = base.to_vec();
        args.extend(["--codecs", "Opus44100Mono"]);
        assert!(Config::resolve(&cli(&args)).is_err());
    }

    #[test]
    fn test_file_config_with_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtable.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "ICEServers": ["stun:file.example.org"],
                "signallingserver": "https://file.example.org",
                "localport": 2000,
                "OPUSFrameDuration": 40.0,
                "codecs": ["Opus24000Mono"],
            })
            .to_string(),
        )
        .unwrap();

        let config = Config::resolve(&cli(&[
            "--config",
            path.to_str().unwrap(),
            "--localport",
            "3000",
        ]))
        .unwrap();

        assert_eq!(config.localport, 3000, "cli wins over file");
        assert_eq!(config.frame_duration, FrameDuration::Ms40);
        assert_eq!(config.codecs.len(), 1);
        assert_eq!(config.signalling_server, "https://file.example.org");
    }
}
