//! Process-backed backend.
//!
//! Runs one external tunnel client process per generation. The process is
//! expected to open a local proxy listener on the address passed through
//! its templated arguments, and to release it when killed.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{render_arg, Backend, BackendError, InstanceHandle, InstanceSpec};
use crate::shutdown::wait_for_shutdown;

/// Default time allowed for a tunnel to start accepting connections.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for the process-backed backend.
#[derive(Debug, Clone)]
pub struct CommandBackendConfig {
    /// Tunnel client executable.
    pub program: PathBuf,
    /// Argument templates, see `render_arg`.
    pub args: Vec<String>,
    /// How long to wait for the instance address to accept connections.
    pub ready_timeout: Duration,
}

impl CommandBackendConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Add an argument template.
    pub fn arg(mut self, template: impl Into<String>) -> Self {
        self.args.push(template.into());
        self
    }
}

/// Backend that spawns an external process per generation.
pub struct CommandBackend {
    config: CommandBackendConfig,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig) -> Self {
        Self { config }
    }

    /// Arguments for one instance.
    pub fn render_args(&self, spec: &InstanceSpec) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|template| render_arg(template, spec))
            .collect()
    }

    fn spawn_process(&self, spec: &InstanceSpec) -> Result<Child, BackendError> {
        let args = self.render_args(spec);
        debug!(
            program = %self.config.program.display(),
            args = ?args,
            region = %spec.region,
            generation = spec.generation,
            "Spawning backend process"
        );

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BackendError::Spawn)?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, *spec, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, *spec, "stderr"));
        }

        Ok(child)
    }

    /// Wait until the instance address accepts connections.
    ///
    /// A successful connect only proves that something listens on the
    /// address. `start` refuses an address that is taken before the child
    /// is spawned, and the child must still be alive after the probe.
    async fn wait_ready(&self, child: &mut Child, spec: &InstanceSpec) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BackendError::Exited {
                    status: status.to_string(),
                });
            }
            if TcpStream::connect(spec.addr).await.is_ok() {
                if let Some(status) = child.try_wait()? {
                    return Err(BackendError::Exited {
                        status: status.to_string(),
                    });
                }
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::NotReady {
                    addr: spec.addr,
                    timeout: self.config.ready_timeout,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle, BackendError> {
        // A listener already on the address would satisfy the readiness probe.
        if TcpStream::connect(spec.addr).await.is_ok() {
            return Err(BackendError::Bind {
                addr: spec.addr,
                source: io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "address already accepting connections",
                ),
            });
        }

        let mut child = self.spawn_process(spec)?;

        if let Err(e) = self.wait_ready(&mut child, spec).await {
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "Backend process already gone");
            }
            return Err(e);
        }

        info!(
            region = %spec.region,
            addr = %spec.addr,
            generation = spec.generation,
            pid = child.id(),
            "Backend process ready"
        );

        let spec = *spec;
        Ok(InstanceHandle::spawn(spec, move |mut cancel| async move {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut cancel) => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "Backend process already gone");
                    }
                    let status = child.wait().await?;
                    debug!(
                        region = %spec.region,
                        generation = spec.generation,
                        status = %status,
                        "Backend process reaped"
                    );
                    Ok(())
                }
                status = child.wait() => {
                    let status = status?;
                    warn!(
                        region = %spec.region,
                        generation = spec.generation,
                        status = %status,
                        "Backend process exited"
                    );
                    Err(BackendError::Exited {
                        status: status.to_string(),
                    })
                }
            }
        }))
    }
}

/// Log each line the backend process writes.
async fn forward_output<R>(stream: R, spec: InstanceSpec, channel: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(
            region = %spec.region,
            generation = spec.generation,
            channel,
            line = %line,
            "Backend output"
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use shuffle_regions::RegionCode;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            region: RegionCode::new("SE").unwrap(),
            addr: "127.0.0.1:1".parse().unwrap(),
            generation: 1,
        }
    }

    #[test]
    fn test_render_args() {
        let backend = CommandBackend::new(
            CommandBackendConfig::new("tunnel-client")
                .arg("--egress-region")
                .arg("{region}")
                .arg("--socks-port={port}"),
        );
        assert_eq!(
            backend.render_args(&spec()),
            vec!["--egress-region", "SE", "--socks-port=1"]
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let backend = CommandBackend::new(CommandBackendConfig::new(
            "/nonexistent/shuffle-tunnel-client",
        ));
        let result = backend.start(&spec()).await;
        assert!(matches!(result, Err(BackendError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_early_exit() {
        let config = CommandBackendConfig::new("sh").arg("-c").arg("exit 3");
        let result = CommandBackend::new(config).start(&spec()).await;
        match result {
            Err(BackendError::Exited { status }) => assert!(status.contains('3')),
            other => panic!("expected early exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_occupied_address_is_refused() {
        let stray = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let spec = InstanceSpec {
            addr: stray.local_addr().unwrap(),
            ..spec()
        };

        let config = CommandBackendConfig::new("sleep").arg("30");
        let result = CommandBackend::new(config).start(&spec).await;
        match result {
            Err(BackendError::Bind { addr, source }) => {
                assert_eq!(addr, spec.addr);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected occupied address, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_ready_times_out() {
        let mut config = CommandBackendConfig::new("sleep").arg("30");
        config.ready_timeout = Duration::from_millis(300);
        let result = CommandBackend::new(config).start(&spec()).await;
        assert!(matches!(result, Err(BackendError::NotReady { .. })));
    }
}
