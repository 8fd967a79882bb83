//! Command-line and environment configuration for the StrasBoard server
//!
//! Every option can be given as a flag or as an environment variable (a `.env`
//! file is loaded first by `main`). [`Config::from_cli`] validates the raw
//! strings into the typed settings of each source.

use chrono_tz::Tz;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

use crate::data::transport::parse_stops;
use crate::data::{
    ElectricityConfig, TemperatureConfig, TempoConfig, TransportConfig, WeatherConfig,
};

/// Error types for configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The timezone name is not in the IANA database
    #[error("Invalid timezone: '{0}'")]
    InvalidTimezone(String),

    /// A publication hour is outside 0..24
    #[error("Invalid {name}: {hour} (expected 0-23)")]
    InvalidHour {
        /// Option the hour came from
        name: &'static str,
        /// Offending value
        hour: u32,
    },

    /// The provisional tariff hour comes after the definitive one
    #[error("Tempo provisional hour ({provisional}) is after definitive hour ({definitive})")]
    CutoffOrder {
        /// Hour tomorrow's colour may first appear
        provisional: u32,
        /// Hour tomorrow's colour is final
        definitive: u32,
    },

    /// The bind address is not an IP address
    #[error("Invalid bind address: '{0}'")]
    InvalidBindAddress(String),

    /// The per-source timeout must be positive
    #[error("Source timeout must be at least one second")]
    ZeroTimeout,

    /// Two sources were registered under the same name
    #[error("Duplicate source name: '{0}'")]
    DuplicateSource(String),
}

/// StrasBoard - dashboard data server
#[derive(Parser, Debug)]
#[command(name = "strasboard")]
#[command(about = "Aggregates weather, transit, sensor, electricity and tariff data behind one JSON API")]
#[command(version)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 80)]
    pub port: u16,

    /// Address to bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds a source may take before its fetch is abandoned
    #[arg(long, env = "SOURCE_TIMEOUT_SECS", default_value_t = 30)]
    pub source_timeout_secs: u64,

    /// Skip the initial fetch of every source at startup
    #[arg(
        long,
        env = "NO_WARMUP",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub no_warmup: bool,

    /// Open-Meteo forecast endpoint
    #[arg(long, env = "WEATHER_API_URL")]
    pub weather_api_url: Option<String>,

    /// Latitude of the forecast location
    #[arg(long, env = "WEATHER_LATITUDE", default_value_t = 48.58, allow_negative_numbers = true)]
    pub weather_latitude: f64,

    /// Longitude of the forecast location
    #[arg(long, env = "WEATHER_LONGITUDE", default_value_t = 7.75, allow_negative_numbers = true)]
    pub weather_longitude: f64,

    /// Timezone of the forecast location
    #[arg(long, env = "WEATHER_TIMEZONE", default_value = "Europe/Paris")]
    pub weather_timezone: String,

    /// CTS SIRI API base URL
    #[arg(long, env = "TRANSPORT_API_URL")]
    pub transport_api_url: Option<String>,

    /// CTS API key (Basic credentials)
    #[arg(long, env = "TRANSPORT_API_KEY", hide_env_values = true)]
    pub transport_api_key: Option<String>,

    /// Stops to monitor: `line,stop name,destination;...`
    #[arg(long, env = "TRANSPORT_STOPS", default_value = "")]
    pub transport_stops: String,

    /// Indoor sensor JSON endpoint
    #[arg(long, env = "TEMPERATURE_SENSOR_URL")]
    pub temperature_sensor_url: Option<String>,

    /// SER portal base URL
    #[arg(long, env = "ELECTRICITY_API_URL")]
    pub electricity_api_url: Option<String>,

    /// SER OAuth client id
    #[arg(long, env = "ELECTRICITY_CLIENT_ID")]
    pub electricity_client_id: Option<String>,

    /// SER account username
    #[arg(long, env = "ELECTRICITY_USERNAME")]
    pub electricity_username: Option<String>,

    /// SER account password
    #[arg(long, env = "ELECTRICITY_PASSWORD", hide_env_values = true)]
    pub electricity_password: Option<String>,

    /// Local hour from which yesterday's consumption may be published
    #[arg(long, env = "ELECTRICITY_CUTOFF_HOUR", default_value_t = 4)]
    pub electricity_cutoff_hour: u32,

    /// RTE tempo calendar API base URL
    #[arg(long, env = "TEMPO_API_URL")]
    pub tempo_api_url: Option<String>,

    /// RTE OAuth token endpoint
    #[arg(long, env = "TEMPO_AUTH_URL")]
    pub tempo_auth_url: Option<String>,

    /// RTE client credentials (Basic)
    #[arg(long, env = "TEMPO_AUTH_TOKEN", hide_env_values = true)]
    pub tempo_auth_token: Option<String>,

    /// Local hour from which tomorrow's colour may be published
    #[arg(long, env = "TEMPO_PROVISIONAL_HOUR", default_value_t = 8)]
    pub tempo_provisional_hour: u32,

    /// Local hour from which tomorrow's colour is definitive
    #[arg(long, env = "TEMPO_DEFINITIVE_HOUR", default_value_t = 11)]
    pub tempo_definitive_hour: u32,

    /// Timezone of the electricity and tariff publication hours
    #[arg(long, env = "PUBLICATION_TIMEZONE", default_value = "Europe/Paris")]
    pub publication_timezone: String,
}

/// Validated configuration for server startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on
    pub listen: SocketAddr,
    /// Fallback log filter
    pub log_level: String,
    /// Per-source fetch ceiling in combined fetches
    pub source_timeout: Duration,
    /// Whether to fetch every source once at startup
    pub warm_up: bool,
    pub weather: WeatherConfig,
    pub transport: TransportConfig,
    pub temperature: TemperatureConfig,
    pub electricity: ElectricityConfig,
    pub tempo: TempoConfig,
}

/// Treats empty strings (e.g. `FOO=` in a .env file) as unset
fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Parses an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::InvalidTimezone(name.to_string()))
}

fn check_hour(name: &'static str, hour: u32) -> Result<u32, ConfigError> {
    if hour < 24 {
        Ok(hour)
    } else {
        Err(ConfigError::InvalidHour { name, hour })
    }
}

impl Config {
    /// Validates parsed arguments into typed settings
    ///
    /// # Arguments
    /// * `cli` - The parsed CLI struct
    ///
    /// # Returns
    /// * `Ok(Config)` ready to build the sources from
    /// * `Err(ConfigError)` for the first invalid value found
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let stops = parse_stops(&cli.transport_stops);
        let ip: IpAddr = cli
            .bind_address
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(cli.bind_address.clone()))?;
        if cli.source_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let weather_timezone = parse_timezone(&cli.weather_timezone)?;
        let publication_timezone = parse_timezone(&cli.publication_timezone)?;

        let cutoff_hour = check_hour("electricity cutoff hour", cli.electricity_cutoff_hour)?;
        let provisional = check_hour("tempo provisional hour", cli.tempo_provisional_hour)?;
        let definitive = check_hour("tempo definitive hour", cli.tempo_definitive_hour)?;
        if provisional > definitive {
            return Err(ConfigError::CutoffOrder {
                provisional,
                definitive,
            });
        }

        Ok(Config {
            listen: SocketAddr::new(ip, cli.port),
            log_level: cli.log_level.clone(),
            source_timeout: Duration::from_secs(cli.source_timeout_secs),
            warm_up: !cli.no_warmup,
            weather: WeatherConfig {
                api_url: non_empty(&cli.weather_api_url),
                latitude: cli.weather_latitude,
                longitude: cli.weather_longitude,
                timezone: weather_timezone,
            },
            transport: TransportConfig {
                api_url: non_empty(&cli.transport_api_url),
                api_key: non_empty(&cli.transport_api_key),
                stops,
            },
            temperature: TemperatureConfig {
                sensor_url: non_empty(&cli.temperature_sensor_url),
            },
            electricity: ElectricityConfig {
                api_url: non_empty(&cli.electricity_api_url),
                client_id: non_empty(&cli.electricity_client_id),
                username: non_empty(&cli.electricity_username),
                password: non_empty(&cli.electricity_password),
                cutoff_hour,
                timezone: publication_timezone,
            },
            tempo: TempoConfig {
                api_url: non_empty(&cli.tempo_api_url),
                auth_url: non_empty(&cli.tempo_auth_url),
                auth_token: non_empty(&cli.tempo_auth_token),
                provisional_hour: provisional,
                definitive_hour: definitive,
                timezone: publication_timezone,
            },
        })
    }
}
