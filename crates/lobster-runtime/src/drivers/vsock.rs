use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::jailer;
use lobster_core::agent::{AgentRequest, AgentResponse, ConnectionsReply, LogsReply};
use lobster_core::config::LobsterdConfig;
use lobster_core::error::{Error, Result};
use lobster_core::tenant::Tenant;

/// Health and hold calls must come back fast.
const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
/// Everything else gets a slightly tighter budget.
const RPC_TIMEOUT: Duration = Duration::from_secs(3);
/// Poll cadence while waiting for the agent to boot.
const WAIT_POLL: Duration = Duration::from_millis(500);

/// RPC client for one tenant's in-guest agent.
///
/// Firecracker exposes guest vsock as a host Unix socket; each call
/// opens the UDS, performs the `CONNECT <port>` handshake, then sends
/// exactly one line-terminated JSON request and reads one response line.
pub struct VsockClient {
    uds_path: PathBuf,
    cid: u32,
    port: u32,
    token: String,
}

impl VsockClient {
    pub fn for_tenant(config: &LobsterdConfig, tenant: &Tenant) -> Self {
        Self {
            uds_path: jailer::vsock_uds_path(&config.jailer.chroot_base_dir, &tenant.vm_id),
            cid: tenant.cid,
            port: config.vsock.agent_port,
            token: tenant.agent_token.clone(),
        }
    }

    async fn connect(&self) -> Result<BufReader<UnixStream>> {
        let stream = UnixStream::connect(&self.uds_path)
            .await
            .map_err(|e| Error::VsockConnectFailed {
                cid: self.cid,
                reason: format!("{}: {}", self.uds_path.display(), e),
            })?;
        let mut reader = BufReader::new(stream);

        // Firecracker hybrid-vsock handshake.
        reader
            .get_mut()
            .write_all(format!("CONNECT {}\n", self.port).as_bytes())
            .await
            .map_err(|e| Error::VsockConnectFailed {
                cid: self.cid,
                reason: format!("handshake write: {}", e),
            })?;
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::VsockConnectFailed {
                cid: self.cid,
                reason: format!("handshake read: {}", e),
            })?;
        if !line.starts_with("OK ") {
            return Err(Error::VsockConnectFailed {
                cid: self.cid,
                reason: format!("expected OK, got {:?}", line.trim()),
            });
        }
        Ok(reader)
    }

    /// One request/response exchange with its own wall-clock budget.
    async fn call(&self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse> {
        let kind = request.kind();
        let fut = async {
            let mut reader = self.connect().await?;
            let mut wire = serde_json::to_string(&request)
                .map_err(|e| Error::ValidationFailed(e.to_string()))?;
            wire.push('\n');
            reader.get_mut().write_all(wire.as_bytes()).await?;

            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.is_empty() {
                return Err(Error::VsockConnectFailed {
                    cid: self.cid,
                    reason: "agent closed the connection".to_string(),
                });
            }
            AgentResponse::parse(&line)
        };
        let resp = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::AgentTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;
        debug!(kind, "agent rpc ok");
        Ok(resp)
    }

    fn token(&self) -> String {
        self.token.clone()
    }

    /// Poll health-ping until the agent answers or the deadline passes.
    pub async fn wait_for_agent(&self, timeout_ms: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.health_ping().await {
                Ok(()) => return Ok(()),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(WAIT_POLL).await;
                }
                Err(_) => return Err(Error::AgentTimeout { timeout_ms }),
            }
        }
    }

    pub async fn health_ping(&self) -> Result<()> {
        self.call(
            AgentRequest::HealthPing {
                token: self.token(),
            },
            SHORT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn inject_secrets(&self, secrets: serde_json::Value) -> Result<()> {
        self.call(
            AgentRequest::InjectSecrets {
                token: self.token(),
                secrets,
            },
            RPC_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn launch_openclaw(&self) -> Result<()> {
        self.call(
            AgentRequest::LaunchOpenclaw {
                token: self.token(),
            },
            RPC_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(
            AgentRequest::Shutdown {
                token: self.token(),
            },
            RPC_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Take a keep-awake hold. The hold protocol is an optional agent
    /// capability; an agent that does not know it yields false instead
    /// of an error.
    pub async fn acquire_hold(&self, id: &str, ttl_ms: u64) -> Result<bool> {
        let res = self
            .call(
                AgentRequest::AcquireHold {
                    token: self.token(),
                    id: id.to_string(),
                    ttl_ms,
                },
                SHORT_TIMEOUT,
            )
            .await;
        match res {
            Ok(_) => Ok(true),
            Err(Error::ValidationFailed(msg)) => {
                warn!(hold = id, %msg, "agent declined hold, proceeding without");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn release_hold(&self, id: &str) -> Result<()> {
        self.call(
            AgentRequest::ReleaseHold {
                token: self.token(),
                id: id.to_string(),
            },
            SHORT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn get_active_connections(&self) -> Result<u64> {
        let resp = self
            .call(
                AgentRequest::GetActiveConnections {
                    token: self.token(),
                },
                SHORT_TIMEOUT,
            )
            .await?;
        let reply: ConnectionsReply = resp.decode()?;
        Ok(reply.active_connections)
    }

    pub async fn fetch_logs(&self, service: Option<&str>) -> Result<LogsReply> {
        let resp = self
            .call(
                AgentRequest::FetchLogs {
                    token: self.token(),
                    service: service.map(|s| s.to_string()),
                },
                Duration::from_secs(10),
            )
            .await?;
        resp.decode()
    }
}
