//! Control channel message definitions
//!
//! A request is a flat map of string fields carrying a mandatory `command`
//! key. On the wire it is a JSON object. A response is a single UTF-8
//! string, or nothing at all.

use crate::transport::{IpcError, IpcResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Key holding the command name in every request map.
pub const COMMAND_KEY: &str = "command";

/// Commands understood by the tunnel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// Liveness probe, answered with `"true"` or `"false"`
    IsCoreRunning,
    /// Latency measurement for the `urls` field
    MeasurePing,
    /// Fetch accumulated core logs
    FetchLogs,
    /// Clear accumulated core logs (no response)
    ClearLogs,
    /// Core version string
    GetVersion,
    /// Start the core inside an already running tunnel
    SimpleStartCore,
    /// Stop the core without tearing the tunnel down
    SimpleStopCore,
}

impl ControlCommand {
    /// Every command, in wire order.
    pub const ALL: [ControlCommand; 7] = [
        ControlCommand::IsCoreRunning,
        ControlCommand::MeasurePing,
        ControlCommand::FetchLogs,
        ControlCommand::ClearLogs,
        ControlCommand::GetVersion,
        ControlCommand::SimpleStartCore,
        ControlCommand::SimpleStopCore,
    ];

    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::IsCoreRunning => "IS_CORE_RUNNING",
            ControlCommand::MeasurePing => "measurePing",
            ControlCommand::FetchLogs => "FETCH_LOGS",
            ControlCommand::ClearLogs => "CLEAR_LOGS",
            ControlCommand::GetVersion => "GET_VERSION",
            ControlCommand::SimpleStartCore => "SIMPLE_START_CORE",
            ControlCommand::SimpleStopCore => "SIMPLE_STOP_CORE",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlCommand::ALL
            .iter()
            .copied()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| IpcError::Protocol(format!("Unknown command: {}", s)))
    }
}

/// A single control channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    command: String,
    fields: BTreeMap<String, String>,
}

impl ControlRequest {
    /// Create a request for a known command with no extra fields
    pub fn new(command: ControlCommand) -> Self {
        Self {
            command: command.as_str().to_string(),
            fields: BTreeMap::new(),
        }
    }

    /// Create a request with an arbitrary command name.
    ///
    /// The tunnel answers commands it does not recognise with no response.
    pub fn raw(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a field to the request
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_core_running() -> Self {
        Self::new(ControlCommand::IsCoreRunning)
    }

    pub fn measure_ping(urls: impl Into<String>) -> Self {
        Self::new(ControlCommand::MeasurePing).with_field("urls", urls)
    }

    pub fn fetch_logs() -> Self {
        Self::new(ControlCommand::FetchLogs)
    }

    pub fn clear_logs() -> Self {
        Self::new(ControlCommand::ClearLogs)
    }

    pub fn get_version() -> Self {
        Self::new(ControlCommand::GetVersion)
    }

    pub fn simple_start_core(
        core_name: impl Into<String>,
        config: impl Into<String>,
        cache_dir: impl Into<String>,
    ) -> Self {
        Self::new(ControlCommand::SimpleStartCore)
            .with_field("coreName", core_name)
            .with_field("config", config)
            .with_field("cacheDir", cache_dir)
    }

    pub fn simple_stop_core() -> Self {
        Self::new(ControlCommand::SimpleStopCore)
    }

    /// The command name exactly as carried on the wire
    pub fn command_name(&self) -> &str {
        &self.command
    }

    /// The command, if it is one this crate knows
    pub fn command(&self) -> Option<ControlCommand> {
        self.command.parse().ok()
    }

    /// Look up a field other than `command`
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Flatten into the wire map, `command` included
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.fields.clone();
        map.insert(COMMAND_KEY.to_string(), self.command.clone());
        map
    }

    /// Encode as a JSON object
    pub fn encode(&self) -> IpcResult<Vec<u8>> {
        serde_json::to_vec(&self.to_map()).map_err(IpcError::Encoding)
    }

    /// Decode a JSON object, requiring a `command` key
    pub fn decode(bytes: &[u8]) -> IpcResult<Self> {
        let mut fields: BTreeMap<String, String> = serde_json::from_slice(bytes)?;
        let command = fields
            .remove(COMMAND_KEY)
            .ok_or_else(|| IpcError::Protocol("Request has no command".to_string()))?;

        Ok(Self { command, fields })
    }
}

/// Helpers for interpreting response strings.
pub mod response {
    /// Boolean responses are the literal `"true"`, compared case-insensitively.
    pub fn is_true(response: Option<&str>) -> bool {
        response
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}
