//! Device controller handle: starts, resets, and stops the IUT.
//!
//! Two backends: QEMU for an emulated kernel image, and a serial TTY for an
//! IUT running on hardware. Backend selection happens once from the run
//! configuration; the orchestrator only sees the trait.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{BoardProfile, IutTarget, RunConfig};
use crate::error::CaseError;

/// QEMU binary used when no TTY is given.
pub const QEMU_BIN: &str = "qemu-system-arm";

/// Unix socket over which the emulated IUT exposes its BTP serial port.
const BTP_SOCKET: &str = "/tmp/bt-server-bredr";

#[async_trait]
pub trait IutController: Send {
    /// Bring the IUT up. Fails with `DeviceUnavailable` when the execution
    /// target cannot be started.
    async fn start(&mut self) -> Result<(), CaseError>;

    /// Run the configured board reset procedure. A no-op returning success
    /// when no reset procedure is configured.
    async fn reset(&mut self) -> Result<(), CaseError>;

    /// Tear the IUT down. Idempotent; repeated stops are no-ops.
    async fn stop(&mut self);
}

pub fn from_config(config: &RunConfig) -> Box<dyn IutController> {
    match &config.target {
        IutTarget::Tty(path) => Box::new(SerialIut::new(path.clone(), config.board.clone())),
        IutTarget::Qemu => Box::new(QemuIut::new(config.image.clone())),
    }
}

/// IUT running as an emulated kernel image. Each start spawns a fresh
/// process, so reset has nothing to do.
pub struct QemuIut {
    image: PathBuf,
    child: Option<Child>,
}

impl QemuIut {
    pub fn new(image: PathBuf) -> Self {
        Self { image, child: None }
    }
}

#[async_trait]
impl IutController for QemuIut {
    async fn start(&mut self) -> Result<(), CaseError> {
        self.stop().await;
        info!(image = %self.image.display(), "starting IUT under QEMU");
        let child = Command::new(QEMU_BIN)
            .args(["-cpu", "cortex-m3", "-machine", "lm3s6965evb", "-nographic"])
            .arg("-serial")
            .arg(format!("unix:{BTP_SOCKET}"))
            .arg("-kernel")
            .arg(&self.image)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaseError::DeviceUnavailable {
                reason: format!("failed to spawn {QEMU_BIN}: {e}"),
            })?;
        self.child = Some(child);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CaseError> {
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("stopping QEMU IUT");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// IUT running on hardware behind a TTY. Start only verifies the device
/// node; the board profile's reset command brings the firmware back to a
/// known state between test cases.
pub struct SerialIut {
    tty: PathBuf,
    board: Option<BoardProfile>,
    started: bool,
}

impl SerialIut {
    pub fn new(tty: PathBuf, board: Option<BoardProfile>) -> Self {
        Self {
            tty,
            board,
            started: false,
        }
    }
}

#[async_trait]
impl IutController for SerialIut {
    async fn start(&mut self) -> Result<(), CaseError> {
        if !self.tty.exists() {
            return Err(CaseError::DeviceUnavailable {
                reason: format!("TTY {} does not exist", self.tty.display()),
            });
        }
        info!(tty = %self.tty.display(), "using IUT on hardware TTY");
        self.started = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CaseError> {
        let Some(board) = &self.board else {
            return Ok(());
        };
        if board.reset_command.is_empty() {
            return Ok(());
        }
        info!(board = %board.name, "resetting IUT board");
        let output = Command::new(&board.reset_command[0])
            .args(&board.reset_command[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CaseError::DeviceUnavailable {
                reason: format!("reset command failed to start: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(board = %board.name, "board reset failed: {}", stderr.trim());
            return Err(CaseError::DeviceUnavailable {
                reason: format!("board reset exited with {}", output.status),
            });
        }
        Ok(())
    }

    async fn stop(&mut self) {
        // Hardware keeps running; nothing to tear down.
        if self.started {
            debug!(tty = %self.tty.display(), "releasing hardware IUT");
            self.started = false;
        }
    }
}
