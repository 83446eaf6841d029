//! Zabbix Sender Telemetry
//!
//! Pushes trapper items to a Zabbix server or proxy using the sender protocol:
//! a `ZBXD\x01` header, the payload length as little-endian `u64`, then a JSON
//! body `{"request":"sender data","data":[{"host","key","value"}]}`.
//!
//! Server and host name default to the local agent configuration
//! (`ServerActive=` and `Hostname=` in `zabbix_agentd.conf`).

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    telemetry::{ErrorContext, MetricValue, TelemetrySink},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

pub const DEFAULT_PORT: u16 = 10051;
pub const DEFAULT_AGENT_CONFIG: &str = "/etc/zabbix/zabbix_agentd.conf";

const HEADER: &[u8; 5] = b"ZBXD\x01";
const MAX_RESPONSE_LEN: u64 = 1 << 20;

#[derive(Debug, Serialize)]
struct SenderItem<'a> {
    host: &'a str,
    key: &'a str,
    value: String,
}

#[derive(Debug, Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: Vec<SenderItem<'a>>,
}

#[derive(Debug, Deserialize)]
struct SenderResponse {
    response: String,
    #[serde(default)]
    info: String,
}

/// Server address and host name as found in an agent config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    pub server_active: Option<String>,
    pub hostname: Option<String>,
}

impl AgentConfig {
    pub fn parse(text: &str) -> Self {
        let mut config = AgentConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some(value) = line.strip_prefix("ServerActive=") {
                config.server_active = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Hostname=") {
                config.hostname = Some(value.trim().to_string());
            }
        }
        config
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&text))
    }
}

/// `host[:port]` of the first entry in a `ServerActive` list.
pub fn first_server(server_active: &str) -> Option<String> {
    let first = server_active
        .split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let has_port = match first.rsplit_once(':') {
        // Bare IPv6 literals contain colons but no port
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        Some(first.to_string())
    } else {
        Some(format!("{}:{}", first, DEFAULT_PORT))
    }
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER.len() + 8 + payload.len());
    frame.extend_from_slice(HEADER);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Trapper sender bound to one server and host name.
#[derive(Debug, Clone)]
pub struct ZabbixSender {
    server: String,
    host: String,
    timeout: Duration,
}

impl ZabbixSender {
    pub fn new(server: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            host: host.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a sender from an agent config, letting explicit values win.
    ///
    /// The host name falls back to `/etc/hostname` when neither the override
    /// nor the agent config provides one.
    pub async fn from_agent_config(
        path: impl AsRef<Path>,
        server: Option<String>,
        host: Option<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let agent = match AgentConfig::load(path).await {
            Ok(agent) => agent,
            Err(e) if server.is_some() && host.is_some() => {
                debug!(path = %path.display(), error = %e, "Agent config unreadable, using overrides");
                AgentConfig::default()
            }
            Err(e) => return Err(e),
        };

        let server = server
            .or(agent.server_active)
            .and_then(|s| first_server(&s))
            .ok_or_else(|| {
                BridgeError::NotAvailable(format!("no ServerActive in {}", path.display()))
            })?;

        let host = match host.or(agent.hostname) {
            Some(host) => host,
            None => tokio::fs::read_to_string("/etc/hostname")
                .await
                .map(|s| s.trim().to_string())
                .map_err(|e| BridgeError::NotAvailable(format!("host name: {}", e)))?,
        };

        Ok(Self::new(server, host))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Send one item and return the server's `info` line.
    pub async fn send(&self, key: &str, value: impl ToString) -> Result<String> {
        let request = SenderRequest {
            request: "sender data",
            data: vec![SenderItem {
                host: &self.host,
                key,
                value: value.to_string(),
            }],
        };
        let payload =
            serde_json::to_vec(&request).map_err(|e| BridgeError::InvalidData(e.to_string()))?;

        debug!(server = %self.server, key, "Sending Zabbix item");
        let response = tokio::time::timeout(self.timeout, self.exchange(&payload))
            .await
            .map_err(|_| BridgeError::Transient(format!("Zabbix {} timed out", self.server)))??;

        if response.response != "success" {
            return Err(BridgeError::OperationFailed(format!(
                "Zabbix rejected {}: {}",
                key, response.info
            )));
        }
        if response.info.contains("failed: 1") {
            warn!(key, info = %response.info, "Zabbix did not process item");
        }
        Ok(response.info)
    }

    async fn exchange(&self, payload: &[u8]) -> Result<SenderResponse> {
        let mut stream = TcpStream::connect(&self.server).await?;
        stream.write_all(&encode_frame(payload)).await?;
        stream.flush().await?;

        let mut header = [0u8; 13];
        stream.read_exact(&mut header).await?;
        if &header[..5] != HEADER {
            return Err(BridgeError::InvalidData(
                "bad Zabbix response header".to_string(),
            ));
        }

        let mut len = [0u8; 8];
        len.copy_from_slice(&header[5..]);
        let len = u64::from_le_bytes(len);
        if len > MAX_RESPONSE_LEN {
            return Err(BridgeError::InvalidData(format!(
                "Zabbix response too large: {} bytes",
                len
            )));
        }

        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;
        serde_json::from_slice(&body).map_err(|e| BridgeError::InvalidData(e.to_string()))
    }
}

#[async_trait]
impl TelemetrySink for ZabbixSender {
    async fn heartbeat(&self, name: &str) -> Result<()> {
        self.send(name, 1).await.map(|_| ())
    }

    async fn metric(&self, name: &str, value: MetricValue) -> Result<()> {
        self.send(name, value).await.map(|_| ())
    }

    /// Zabbix has no event channel; errors are only logged.
    async fn capture_error(&self, context: ErrorContext) -> Result<()> {
        error!(tags = ?context.tags, "{}", context.message);
        Ok(())
    }
}
