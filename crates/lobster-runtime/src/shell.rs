use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use lobster_core::error::{Error, Result};

/// Cap on captured bytes per stream.
const MAX_CAPTURE: u64 = 1024 * 1024;

/// Default wall-clock budget when the caller does not pick one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for one host command invocation.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
            cwd: None,
        }
    }
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> String {
        self.stdout.trim().to_string()
    }
}

/// Run a host command, failing on non-zero exit or timeout.
pub async fn exec(argv: &[&str], opts: &ExecOpts) -> Result<ExecOutput> {
    let out = exec_unchecked(argv, opts).await?;
    if !out.success() {
        return Err(Error::ExecFailed {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            exit_code: Some(out.exit_code),
            signal: None,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out)
}

/// Run a host command where a non-zero exit is itself meaningful
/// (`test -x`, `iptables -C`, ...). Still fails on spawn errors and
/// timeouts.
pub async fn exec_unchecked(argv: &[&str], opts: &ExecOpts) -> Result<ExecOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::ValidationFailed("empty argv".to_string()))?;

    debug!(cmd = %argv.join(" "), "exec");

    // New process group so a timeout kill reaches descendants too.
    let mut std_cmd = std::process::Command::new(program);
    std_cmd.args(args);
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }
    for (k, v) in &opts.env {
        std_cmd.env(k, v);
    }
    if let Some(cwd) = &opts.cwd {
        std_cmd.current_dir(cwd);
    }

    let mut child = Command::from(std_cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::ExecFailed {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            exit_code: None,
            signal: None,
            stderr: format!("spawn failed: {}", e),
        })?;
    let pid = child.id();

    let stdout_pipe = child.stdout.take().expect("stdout piped");
    let stderr_pipe = child.stderr.take().expect("stderr piped");

    let capture = async {
        let (a, b, status) = tokio::join!(
            read_capped(stdout_pipe),
            read_capped(stderr_pipe),
            child.wait(),
        );
        Ok::<_, std::io::Error>((a?, b?, status?))
    };

    match tokio::time::timeout(opts.timeout, capture).await {
        Ok(Ok((stdout_buf, stderr_buf, status))) => {
            let exit_code = status.code().unwrap_or_else(|| {
                use std::os::unix::process::ExitStatusExt;
                status.signal().map(|s| 128 + s).unwrap_or(-1)
            });
            Ok(ExecOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
                stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
            })
        }
        Ok(Err(e)) => Err(Error::ExecFailed {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            exit_code: None,
            signal: None,
            stderr: format!("i/o error: {}", e),
        }),
        Err(_) => {
            kill_group(pid);
            Err(Error::ExecFailed {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                exit_code: None,
                signal: Some(libc::SIGKILL),
                stderr: format!("timed out after {:?}", opts.timeout),
            })
        }
    }
}

/// Run a command and return trimmed stdout.
pub async fn exec_stdout(argv: &[&str], opts: &ExecOpts) -> Result<String> {
    Ok(exec(argv, opts).await?.stdout_trimmed())
}

/// Read a stream up to the capture cap, then keep draining so the child
/// never blocks on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut r: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut r).take(MAX_CAPTURE).read_to_end(&mut buf).await?;
    tokio::io::copy(&mut r, &mut tokio::io::sink()).await?;
    Ok(buf)
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Negative pid addresses the whole process group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}
