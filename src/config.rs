use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::timer::Millis;

pub const DEFAULT_ROBUSTNESS_VARIABLE: u8 = 2;
pub const DEFAULT_QUERY_INTERVAL: Millis = 125_000;
pub const DEFAULT_QUERY_RESPONSE_INTERVAL: Millis = 10_000;
pub const DEFAULT_LAST_MEMBER_QUERY_INTERVAL: Millis = 1_000;
pub const DEFAULT_UNSOLICITED_REPORT_INTERVAL: Millis = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for std::io::Error {
    fn from(e: ConfigError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    pub querier: Option<QuerierConfig>,
    pub responder: Option<ResponderConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(file)?;
        let config = Self::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self, std::io::Error> {
        let config: Config = toml::from_str(content).map_err(|e| std::io::Error::other(e))?;
        if let Some(querier) = &config.querier {
            querier.validate()?;
        }
        if let Some(responder) = &config.responder {
            responder.validate()?;
        }
        Ok(config)
    }
}

fn default_robustness() -> u8 {
    DEFAULT_ROBUSTNESS_VARIABLE
}

fn default_query_interval() -> Millis {
    DEFAULT_QUERY_INTERVAL
}

fn default_query_response_interval() -> Millis {
    DEFAULT_QUERY_RESPONSE_INTERVAL
}

fn default_last_member_query_interval() -> Millis {
    DEFAULT_LAST_MEMBER_QUERY_INTERVAL
}

fn default_unsolicited_report_interval() -> Millis {
    DEFAULT_UNSOLICITED_REPORT_INTERVAL
}

/// Router-side parameters (RFC 3376 §8). All intervals are milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QuerierConfig {
    pub source: Ipv4Addr,

    #[serde(default = "default_robustness")]
    pub robustness: u8,

    #[serde(default = "default_query_interval")]
    pub query_interval: Millis,

    #[serde(default = "default_query_response_interval")]
    pub query_response_interval: Millis,

    #[serde(default = "default_last_member_query_interval")]
    pub last_member_query_interval: Millis,

    /// defaults to the robustness variable
    #[serde(default)]
    pub last_member_query_count: Option<u32>,

    /// defaults to a quarter of the query interval
    #[serde(default)]
    pub startup_query_interval: Option<Millis>,

    /// defaults to the robustness variable
    #[serde(default)]
    pub startup_query_count: Option<u32>,
}

impl QuerierConfig {
    pub fn new(source: Ipv4Addr) -> Self {
        Self {
            source,
            robustness: DEFAULT_ROBUSTNESS_VARIABLE,
            query_interval: DEFAULT_QUERY_INTERVAL,
            query_response_interval: DEFAULT_QUERY_RESPONSE_INTERVAL,
            last_member_query_interval: DEFAULT_LAST_MEMBER_QUERY_INTERVAL,
            last_member_query_count: None,
            startup_query_interval: None,
            startup_query_count: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robustness == 0 {
            return Err(ConfigError::new("querier: robustness must not be zero"));
        }
        if self.query_interval == 0 || self.last_member_query_interval == 0 {
            return Err(ConfigError::new("querier: intervals must be positive"));
        }
        if self.query_response_interval >= self.query_interval {
            return Err(ConfigError::new("querier: query_response_interval must be less than query_interval"));
        }
        if self.last_member_query_count() == 0 || self.startup_query_count() == 0 {
            return Err(ConfigError::new("querier: query counts must be positive"));
        }
        if self.startup_query_interval() == 0 {
            return Err(ConfigError::new("querier: startup_query_interval must be positive"));
        }
        if !self.source.is_unicast_host() {
            return Err(ConfigError::new(format!("querier: source {} is not a unicast address", self.source)));
        }
        Ok(())
    }

    pub fn last_member_query_count(&self) -> u32 {
        self.last_member_query_count.unwrap_or(self.robustness as u32)
    }

    pub fn startup_query_interval(&self) -> Millis {
        self.startup_query_interval.unwrap_or(self.query_interval / 4)
    }

    pub fn startup_query_count(&self) -> u32 {
        self.startup_query_count.unwrap_or(self.robustness as u32)
    }

    /// GMI = RV * QI + QRI
    pub fn group_membership_interval(&self) -> Millis {
        self.robustness as Millis * self.query_interval + self.query_response_interval
    }

    /// LMQT = LMQC * LMQI
    pub fn last_member_query_time(&self) -> Millis {
        self.last_member_query_count() as Millis * self.last_member_query_interval
    }

    /// QRV as advertised; values that do not fit the field are sent as zero.
    pub fn qrv(&self) -> u8 {
        if self.robustness > 7 {
            0
        } else {
            self.robustness
        }
    }
}

/// Host-side parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResponderConfig {
    pub source: Ipv4Addr,

    #[serde(default = "default_unsolicited_report_interval")]
    pub unsolicited_report_interval: Millis,

    /// used until a query advertises a QRV
    #[serde(default = "default_robustness")]
    pub robustness: u8,

    /// groups joined at startup
    #[serde(default)]
    pub groups: Vec<Ipv4Addr>,
}

impl ResponderConfig {
    pub fn new(source: Ipv4Addr) -> Self {
        Self {
            source,
            unsolicited_report_interval: DEFAULT_UNSOLICITED_REPORT_INTERVAL,
            robustness: DEFAULT_ROBUSTNESS_VARIABLE,
            groups: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robustness == 0 {
            return Err(ConfigError::new("responder: robustness must not be zero"));
        }
        if !self.source.is_unicast_host() {
            return Err(ConfigError::new(format!("responder: source {} is not a unicast address", self.source)));
        }
        for group in &self.groups {
            if !group.is_multicast() {
                return Err(ConfigError::new(format!("responder: {} is not a multicast group", group)));
            }
        }
        Ok(())
    }
}

trait UnicastAddr {
    fn is_unicast_host(&self) -> bool;
}

impl UnicastAddr for Ipv4Addr {
    fn is_unicast_host(&self) -> bool {
        !self.is_unspecified() && !self.is_multicast() && !self.is_broadcast()
    }
}
