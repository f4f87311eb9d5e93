//! Launching and stopping server processes.

use crate::transport::Transport;
use crate::udp::{find_free_port, UdpTransport};
use crate::WireError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Printed by the server once it accepts commands.
pub const READY_BANNER: &str = "SuperCollider 3 server ready";

const FAILURE_MARKERS: &[&str] = &[
    "could not initialize audio",
    "ERROR: failed to open UDP socket",
    "Exception in World_New",
];

/// Everything needed to start and address one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub executable: PathBuf,
    pub host: IpAddr,
    /// `0` picks a free port at launch time.
    pub port: u16,
    pub input_channels: u32,
    pub output_channels: u32,
    pub audio_bus_channels: u32,
    pub control_bus_channels: u32,
    pub buffers: u32,
    pub max_nodes: u32,
    pub boot_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("scsynth"),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 57110,
            input_channels: 8,
            output_channels: 8,
            audio_bus_channels: 1024,
            control_bus_channels: 16384,
            buffers: 1024,
            max_nodes: 1024,
            boot_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerOptions {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// First audio bus not wired to hardware.
    pub fn first_private_audio_bus(&self) -> u32 {
        self.output_channels + self.input_channels
    }

    pub fn private_audio_bus_count(&self) -> u32 {
        self.audio_bus_channels
            .saturating_sub(self.first_private_audio_bus())
    }

    /// Replace a zero port with one that is free right now.
    pub fn resolve_port(&mut self) -> Result<(), WireError> {
        if self.port == 0 {
            self.port = find_free_port()?;
        }
        Ok(())
    }

    pub fn command_line(&self) -> Vec<String> {
        vec![
            "-u".to_string(),
            self.port.to_string(),
            "-i".to_string(),
            self.input_channels.to_string(),
            "-o".to_string(),
            self.output_channels.to_string(),
            "-a".to_string(),
            self.audio_bus_channels.to_string(),
            "-c".to_string(),
            self.control_bus_channels.to_string(),
            "-b".to_string(),
            self.buffers.to_string(),
            "-n".to_string(),
            self.max_nodes.to_string(),
        ]
    }
}

/// A started (but not necessarily ready) server process.
#[async_trait]
pub trait ServerProcess: Send {
    /// Resolve once the server reports it accepts commands.
    async fn wait_ready(&mut self) -> Result<(), WireError>;

    /// Give the process `grace` to exit on its own, then kill it.
    async fn shutdown(&mut self, grace: Duration);
}

/// Starts server processes and opens transports to them.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, options: &ServerOptions) -> Result<Box<dyn ServerProcess>, WireError>;

    async fn connect(&self, options: &ServerOptions) -> Result<Arc<dyn Transport>, WireError>;
}

/// Launches the real `scsynth` binary and talks to it over UDP.
#[derive(Debug, Clone, Default)]
pub struct ScsynthLauncher;

#[async_trait]
impl Launcher for ScsynthLauncher {
    async fn launch(&self, options: &ServerOptions) -> Result<Box<dyn ServerProcess>, WireError> {
        let args = options.command_line();
        info!(executable = %options.executable.display(), ?args, "launching server");

        let mut child = Command::new(&options.executable)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WireError::Launch {
                path: options.executable.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(WireError::ProcessExited)?;
        Ok(Box::new(ScsynthProcess {
            child,
            lines: BufReader::new(stdout).lines(),
        }))
    }

    async fn connect(&self, options: &ServerOptions) -> Result<Arc<dyn Transport>, WireError> {
        let transport: Arc<dyn Transport> = UdpTransport::connect(options.address()).await?;
        Ok(transport)
    }
}

struct ScsynthProcess {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl ServerProcess for ScsynthProcess {
    async fn wait_ready(&mut self) -> Result<(), WireError> {
        while let Some(line) = self.lines.next_line().await? {
            debug!(target: "scsynth", "{line}");
            if line.contains(READY_BANNER) {
                return Ok(());
            }
            if FAILURE_MARKERS.iter().any(|marker| line.contains(marker)) {
                return Err(WireError::BootFailed(line));
            }
        }
        Err(WireError::ProcessExited)
    }

    async fn shutdown(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "server exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting on server failed"),
            Err(_) => {
                warn!("server ignored quit, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill server");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_buses_start_after_hardware() {
        let options = ServerOptions::default();
        assert_eq!(options.first_private_audio_bus(), 16);
        assert_eq!(options.private_audio_bus_count(), 1008);
    }

    #[test]
    fn command_line_carries_port_and_layout() {
        let options = ServerOptions {
            port: 57999,
            output_channels: 2,
            ..ServerOptions::default()
        };
        let args = options.command_line();
        assert_eq!(&args[..2], &["-u".to_string(), "57999".to_string()]);
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "2"));
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let options = ServerOptions {
            executable: PathBuf::from("/nonexistent/switchboard-test-scsynth"),
            ..ServerOptions::default()
        };
        let result = ScsynthLauncher.launch(&options).await;
        assert!(matches!(result, Err(WireError::Launch { .. })));
    }
}
