use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the orchestrator can surface, one variant per kind.
///
/// Drivers return these directly; the lifecycle engine adds tenant context
/// where it has it. The CLI maps `code()` into the `--json` error object.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lobsterd only runs on Linux (detected {0})")]
    NotLinux(String),

    #[error("lobsterd must run as root")]
    NotRoot,

    #[error("/dev/kvm not accessible: {0}")]
    KvmNotAvailable(String),

    #[error("firecracker binary missing or not executable: {0}")]
    FirecrackerNotFound(String),

    #[error("jailer binary missing or not executable: {0}")]
    JailerNotFound(String),

    #[error("jailer chroot setup failed: {0}")]
    JailerSetupFailed(String),

    #[error("network setup failed: {0}")]
    NetworkSetupFailed(String),

    #[error("firewall operation failed: {0}")]
    FirewallError(String),

    #[error("zfs operation failed: {0}")]
    ZfsError(String),

    #[error("vsock connect failed for cid {cid}: {reason}")]
    VsockConnectFailed { cid: u32, reason: String },

    #[error("guest agent did not answer within {timeout_ms}ms")]
    AgentTimeout { timeout_ms: u64 },

    #[error("caddy admin api: {0}")]
    CaddyApiError(String),

    #[error("reverse proxy: {0}")]
    ProxyError(String),

    #[error("registry is locked by a concurrent operation")]
    RegistryLocked,

    #[error("registry is corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant already exists: {0}")]
    TenantExists(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("operation already in flight for tenant {0}")]
    OperationInFlight(String),

    #[error("command {argv:?} failed (exit {exit_code:?}, signal {signal:?}): {stderr}")]
    ExecFailed {
        argv: Vec<String>,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("repair attempts exceeded for tenant {0}, marked degraded")]
    RepairExceeded(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for the `--json` error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotLinux(_) => "NotLinux",
            Error::NotRoot => "NotRoot",
            Error::KvmNotAvailable(_) => "KvmNotAvailable",
            Error::FirecrackerNotFound(_) => "FirecrackerNotFound",
            Error::JailerNotFound(_) => "JailerNotFound",
            Error::JailerSetupFailed(_) => "JailerSetupFailed",
            Error::NetworkSetupFailed(_) => "NetworkSetupFailed",
            Error::FirewallError(_) => "FirewallError",
            Error::ZfsError(_) => "ZfsError",
            Error::VsockConnectFailed { .. } => "VsockConnectFailed",
            Error::AgentTimeout { .. } => "AgentTimeout",
            Error::CaddyApiError(_) => "CaddyApiError",
            Error::ProxyError(_) => "ProxyError",
            Error::RegistryLocked => "RegistryLocked",
            Error::RegistryCorrupt(_) => "RegistryCorrupt",
            Error::TenantNotFound(_) => "TenantNotFound",
            Error::TenantExists(_) => "TenantExists",
            Error::ValidationFailed(_) => "ValidationFailed",
            Error::OperationInFlight(_) => "OperationInFlight",
            Error::ExecFailed { .. } => "ExecFailed",
            Error::RepairExceeded(_) => "RepairExceeded",
            Error::Io(_) => "Io",
        }
    }
}
