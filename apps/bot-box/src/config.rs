use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid url `{value}`: {source}")]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("`{0}` must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("unknown hardware kind `{0}` (expected serial, ipc or console)")]
    UnknownHardware(String),
    #[error("{kind} hardware requires `{field}`")]
    HardwareParam {
        kind: HardwareKind,
        field: &'static str,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum HardwareKind {
    #[default]
    Serial,
    Ipc,
    Console,
}

impl HardwareKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HardwareKind::Serial => "serial",
            HardwareKind::Ipc => "ipc",
            HardwareKind::Console => "console",
        }
    }
}

impl fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(HardwareKind::Serial),
            "ipc" => Ok(HardwareKind::Ipc),
            "console" => Ok(HardwareKind::Console),
            other => Err(ConfigError::UnknownHardware(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareSettings {
    Serial { port_name: String, baud_rate: u32 },
    Ipc { listen_port: u16, robot_addr: String },
    Console,
}

impl HardwareSettings {
    pub fn kind(&self) -> HardwareKind {
        match self {
            HardwareSettings::Serial { .. } => HardwareKind::Serial,
            HardwareSettings::Ipc { .. } => HardwareKind::Ipc,
            HardwareSettings::Console => HardwareKind::Console,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioSettings {
    pub input_enabled: bool,
    pub output_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub reconnect: Duration,
    pub ping_interval: Duration,
    pub send_timeout: Duration,
    pub hardware_reconnect: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub srv_url: Url,
    pub public_key: String,
    pub secret_key: String,
    pub stun_urls: Vec<String>,
    pub hardware: HardwareSettings,
    pub audio: AudioSettings,
    pub timing: Timing,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    srv_url: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    stun_urls: Option<String>,
    #[serde(default)]
    hardware: Option<String>,
    #[serde(default)]
    port_name: Option<String>,
    #[serde(default)]
    baud_rate: Option<u32>,
    #[serde(default)]
    bot_box_ipc_port: Option<u16>,
    #[serde(default)]
    robot_ipc_host: Option<String>,
    #[serde(default)]
    robot_ipc_port: Option<u16>,
    #[serde(default)]
    is_audio_input_enabled: bool,
    #[serde(default)]
    is_audio_output_enabled: bool,
    #[serde(default = "default_one")]
    reconnect_timeout_sec: u64,
    #[serde(default = "default_one")]
    ping_interval_sec: u64,
    #[serde(default = "default_send_timeout")]
    send_timeout_sec: u64,
    #[serde(default = "default_one")]
    hardware_reconnect_timeout_sec: u64,
}

fn default_one() -> u64 {
    1
}

fn default_send_timeout() -> u64 {
    5
}

impl Settings {
    /// Reads the process environment. `hardware` overrides the `hardware` variable.
    pub fn load(hardware: Option<HardwareKind>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true));
        if let Some(kind) = hardware {
            builder = builder.set_override("hardware", kind.as_str())?;
        }
        Self::from_builder(builder)
    }

    /// Builds settings from explicit key/value pairs instead of the environment.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(key.as_ref(), value.as_ref())?;
        }
        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let raw: RawSettings = builder.build()?.try_deserialize()?;
        raw.validate()
    }
}

impl RawSettings {
    fn validate(self) -> Result<Settings, ConfigError> {
        let srv_url = required(self.srv_url, "srv_url")?;
        let srv_url = Url::parse(&srv_url).map_err(|source| ConfigError::InvalidUrl {
            value: srv_url.clone(),
            source,
        })?;
        let public_key = required(self.public_key, "public_key")?;
        let secret_key = required(self.secret_key, "secret_key")?;

        let stun_urls = self
            .stun_urls
            .as_deref()
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let kind = match normalize(self.hardware) {
            Some(kind) => kind.parse()?,
            None => HardwareKind::default(),
        };
        let hardware = match kind {
            HardwareKind::Serial => HardwareSettings::Serial {
                port_name: normalize(self.port_name).ok_or(ConfigError::HardwareParam {
                    kind,
                    field: "port_name",
                })?,
                baud_rate: self.baud_rate.ok_or(ConfigError::HardwareParam {
                    kind,
                    field: "baud_rate",
                })?,
            },
            HardwareKind::Ipc => {
                let listen_port = self.bot_box_ipc_port.ok_or(ConfigError::HardwareParam {
                    kind,
                    field: "bot_box_ipc_port",
                })?;
                let host = normalize(self.robot_ipc_host).unwrap_or_else(|| "127.0.0.1".into());
                let port = self.robot_ipc_port.ok_or(ConfigError::HardwareParam {
                    kind,
                    field: "robot_ipc_port",
                })?;
                HardwareSettings::Ipc {
                    listen_port,
                    robot_addr: format!("{host}:{port}"),
                }
            }
            HardwareKind::Console => HardwareSettings::Console,
        };

        let timing = Timing {
            reconnect: seconds(self.reconnect_timeout_sec, "reconnect_timeout_sec")?,
            ping_interval: seconds(self.ping_interval_sec, "ping_interval_sec")?,
            send_timeout: seconds(self.send_timeout_sec, "send_timeout_sec")?,
            hardware_reconnect: seconds(
                self.hardware_reconnect_timeout_sec,
                "hardware_reconnect_timeout_sec",
            )?,
        };

        Ok(Settings {
            srv_url,
            public_key,
            secret_key,
            stun_urls,
            hardware,
            audio: AudioSettings {
                input_enabled: self.is_audio_input_enabled,
                output_enabled: self.is_audio_output_enabled,
            },
            timing,
        })
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    normalize(value).ok_or(ConfigError::Missing(name))
}

fn seconds(value: u64, name: &'static str) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroInterval(name));
    }
    Ok(Duration::from_secs(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("srv_url", "wss://arena.example.com/box"),
            ("public_key", "pk-1"),
            ("secret_key", "s3cret"),
        ]
    }

    #[test]
    fn console_settings_with_defaults() {
        let mut pairs = base();
        pairs.push(("hardware", "console"));
        pairs.push(("stun_urls", "stun:a:3478, stun:b:3478,,"));
        let settings = Settings::from_pairs(pairs).unwrap();

        assert_eq!(settings.srv_url.as_str(), "wss://arena.example.com/box");
        assert_eq!(settings.stun_urls, vec!["stun:a:3478", "stun:b:3478"]);
        assert_eq!(settings.hardware, HardwareSettings::Console);
        assert_eq!(settings.audio, AudioSettings::default());
        assert_eq!(settings.timing.reconnect, Duration::from_secs(1));
        assert_eq!(settings.timing.ping_interval, Duration::from_secs(1));
        assert_eq!(settings.timing.send_timeout, Duration::from_secs(5));
        assert_eq!(settings.timing.hardware_reconnect, Duration::from_secs(1));
    }

    #[test]
    fn serial_is_the_default_and_needs_a_port() {
        let err = Settings::from_pairs(base()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::HardwareParam {
                kind: HardwareKind::Serial,
                field: "port_name"
            }
        ));

        let mut pairs = base();
        pairs.push(("port_name", "/dev/ttyUSB0"));
        pairs.push(("baud_rate", "115200"));
        pairs.push(("is_audio_input_enabled", "true"));
        let settings = Settings::from_pairs(pairs).unwrap();
        assert_eq!(
            settings.hardware,
            HardwareSettings::Serial {
                port_name: "/dev/ttyUSB0".into(),
                baud_rate: 115_200
            }
        );
        assert!(settings.audio.input_enabled);
        assert!(!settings.audio.output_enabled);
    }

    #[test]
    fn ipc_defaults_robot_host_to_loopback() {
        let mut pairs = base();
        pairs.extend([
            ("hardware", "IPC"),
            ("bot_box_ipc_port", "5556"),
            ("robot_ipc_port", "5555"),
        ]);
        let settings = Settings::from_pairs(pairs).unwrap();
        assert_eq!(
            settings.hardware,
            HardwareSettings::Ipc {
                listen_port: 5556,
                robot_addr: "127.0.0.1:5555".into()
            }
        );
        assert_eq!(settings.hardware.kind(), HardwareKind::Ipc);
    }

    #[test]
    fn rejects_missing_credentials_and_bad_values() {
        let err = Settings::from_pairs([("srv_url", "wss://x")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("public_key")));

        let mut pairs = base();
        pairs[0] = ("srv_url", "not a url");
        assert!(matches!(
            Settings::from_pairs(pairs).unwrap_err(),
            ConfigError::InvalidUrl { .. }
        ));

        let mut pairs = base();
        pairs.push(("hardware", "console"));
        pairs.push(("ping_interval_sec", "0"));
        assert!(matches!(
            Settings::from_pairs(pairs).unwrap_err(),
            ConfigError::ZeroInterval("ping_interval_sec")
        ));

        let mut pairs = base();
        pairs.push(("hardware", "gpio"));
        assert!(matches!(
            Settings::from_pairs(pairs).unwrap_err(),
            ConfigError::UnknownHardware(kind) if kind == "gpio"
        ));
    }
}
