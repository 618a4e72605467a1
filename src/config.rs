//! Configuration surface for a node: one INI file for the IVR gateway and
//! one for the SMS gateway.
//!
//! Missing-but-unrequested sections are tolerated; a section that enables a
//! feature but omits its credentials refuses startup.

use std::path::Path;

use config::{Config, File, FileFormat};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Unreadable {
        path: String,
        source: config::ConfigError,
    },

    #[error("[{section}] is enabled but option {option} is missing")]
    MissingOption {
        section: &'static str,
        option: &'static str,
    },

    #[error("option {option} has an invalid value: {reason}")]
    InvalidValue { option: &'static str, reason: String },
}

/// Parsed `ivr.conf`.
#[derive(Debug, Clone)]
pub struct IvrConfig {
    /// TCP port for the FastAGI server.
    pub fastagi_port: u16,
    /// Name of the PBX text-to-speech application.
    pub default_tts: String,
    /// Whether this node accepts (and re-routes) incoming calls.
    pub incoming_enabled: bool,
    /// Outgoing-call gateway settings, when this node lends dial-out lines.
    pub outgoing: Option<OutgoingIvrConfig>,
}

/// `[outgoing]` + `[speech-server]` settings.
#[derive(Debug, Clone)]
pub struct OutgoingIvrConfig {
    pub channels: Vec<String>,
    pub gateway_address: Option<String>,
    pub local_int_code: Option<String>,
    pub int_dialout: Option<String>,
    pub prefix: Option<String>,
    pub internal_extension_length: Option<usize>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub speech_server_address: String,
    pub speech_server_port: u16,
}

/// Parsed `sms.conf`.
#[derive(Debug, Clone, Default)]
pub struct SmsConfig {
    pub receive: Option<SmsReceiveConfig>,
    pub send: Option<SmsSendConfig>,
}

/// `[receive]` settings: the HTTP endpoint the SMS gateway delivers to.
#[derive(Debug, Clone)]
pub struct SmsReceiveConfig {
    pub port: u16,
}

/// `[sendsms]` settings: the Kannel sendsms service.
#[derive(Debug, Clone)]
pub struct SmsSendConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn load_ini(path: &Path) -> Result<Config, ConfigError> {
    Config::builder()
        .add_source(File::new(
            path.to_str().unwrap_or_default(),
            FileFormat::Ini,
        ))
        .build()
        .map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })
}

fn get_port(cfg: &Config, option: &'static str, default: u16) -> Result<u16, ConfigError> {
    match cfg.get_int(option) {
        Ok(value) => u16::try_from(value).map_err(|_| ConfigError::InvalidValue {
            option,
            reason: format!("{value} is not a valid port"),
        }),
        Err(_) => Ok(default),
    }
}

fn require(
    cfg: &Config,
    section: &'static str,
    option: &'static str,
    key: &str,
) -> Result<String, ConfigError> {
    cfg.get_string(key)
        .map_err(|_| ConfigError::MissingOption { section, option })
}

/// Parses the IVR gateway configuration file.
pub fn parse_ivr_config(path: &Path) -> Result<IvrConfig, ConfigError> {
    let cfg = load_ini(path)?;

    let fastagi_port = get_port(&cfg, "general.fastagi_port", 6500)?;
    let default_tts = cfg
        .get_string("general.default_tts")
        .unwrap_or_else(|_| "flite".to_string());
    let incoming_enabled = cfg.get_bool("incoming.enabled").unwrap_or(false);

    let outgoing = if cfg.get_bool("outgoing.enabled").unwrap_or(false) {
        let channels = cfg
            .get_string("outgoing.channels")
            .map(|raw| {
                raw.split(',')
                    .map(|chan| chan.trim().to_string())
                    .filter(|chan| !chan.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| vec!["Console/dsp".to_string()]);
        let internal_extension_length = match cfg.get_string("outgoing.internal_extension_length") {
            Ok(raw) => Some(raw.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                option: "outgoing.internal_extension_length",
                reason: format!("{raw:?} is not a number"),
            })?),
            Err(_) => None,
        };
        Some(OutgoingIvrConfig {
            channels,
            gateway_address: cfg.get_string("outgoing.gateway_address").ok(),
            local_int_code: cfg.get_string("outgoing.local_int_code").ok(),
            int_dialout: cfg.get_string("outgoing.int_dialout").ok(),
            prefix: cfg.get_string("outgoing.prefix").ok(),
            internal_extension_length,
            host: cfg
                .get_string("outgoing.host")
                .unwrap_or_else(|_| "localhost".to_string()),
            port: get_port(&cfg, "outgoing.port", 5038)?,
            username: require(&cfg, "outgoing", "username", "outgoing.username")?,
            secret: require(&cfg, "outgoing", "secret", "outgoing.secret")?,
            speech_server_address: cfg
                .get_string("speech-server.speech_server_address")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            speech_server_port: get_port(&cfg, "speech-server.speech_server_port", 9000)?,
        })
    } else {
        None
    };

    Ok(IvrConfig {
        fastagi_port,
        default_tts,
        incoming_enabled,
        outgoing,
    })
}

/// Parses the SMS gateway configuration file.
pub fn parse_sms_config(path: &Path) -> Result<SmsConfig, ConfigError> {
    let cfg = load_ini(path)?;

    let receive = if cfg.get_bool("receive.enabled").unwrap_or(false) {
        Some(SmsReceiveConfig {
            port: get_port(&cfg, "receive.port", 4500)?,
        })
    } else {
        None
    };

    let send = if cfg.get_bool("sendsms.enabled").unwrap_or(false) {
        Some(SmsSendConfig {
            host: cfg
                .get_string("sendsms.host")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: get_port(&cfg, "sendsms.port", 13013)?,
            username: require(&cfg, "sendsms", "username", "sendsms.username")?,
            password: require(&cfg, "sendsms", "password", "sendsms.password")?,
        })
    } else {
        None
    };

    Ok(SmsConfig { receive, send })
}
