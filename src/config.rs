//! Run configuration and the board profile registry.
//!
//! `RunConfig` is the validated parameter set the CLI hands to the core.
//! Board reset commands live in a layered registry: an environment variable
//! override, then the standard system location, then compiled-in defaults.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::iut::QEMU_BIN;

/// How BTP communication with the IUT is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IutTarget {
    /// IUT runs on hardware; BTP goes over this TTY.
    Tty(PathBuf),
    /// No TTY given; the IUT runs in QEMU.
    Qemu,
}

/// Reset procedure for one supported DUT board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardProfile {
    pub name: String,
    pub reset_command: Vec<String>,
}

/// Validated parameters for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Addresses of the PTS automation engines, in session order.
    pub engine_addrs: Vec<SocketAddr>,
    /// Local address the engines should call back to, if any.
    pub local_addr: Option<String>,
    /// PTS workspace reference, resolved on the engine side.
    pub workspace: String,
    /// Kernel image: passed to QEMU, or used to locate board reset assets.
    pub image: PathBuf,
    pub target: IutTarget,
    pub board: Option<BoardProfile>,
    /// Bluetooth device address of the IUT.
    pub bd_addr: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Maximum extra attempts per failed test case.
    pub retry_limit: u32,
    /// Raise the engine-side log level to maximum.
    pub max_logging: bool,
    /// Verdict store table identifier; persistence is off when absent.
    pub store_table: Option<String>,
}

impl RunConfig {
    /// Sanity-check paths and devices before any session starts.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.engine_addrs.is_empty() {
            return Err(RunError::Config(
                "server IP address not specified".to_string(),
            ));
        }

        match &self.target {
            IutTarget::Tty(tty) => {
                let path = tty.to_string_lossy();
                if !path.starts_with("/dev/tty") && !path.starts_with("/dev/pts") {
                    return Err(RunError::Config(format!("{path} is not a TTY file")));
                }
                if !tty.exists() {
                    return Err(RunError::Config(format!("TTY file {path} does not exist")));
                }
            }
            IutTarget::Qemu => {
                if !binary_on_path(QEMU_BIN) {
                    return Err(RunError::Config(format!(
                        "{QEMU_BIN} is needed but not found"
                    )));
                }
            }
        }

        if !self.image.is_file() {
            return Err(RunError::Config(format!(
                "kernel image {} is not a file",
                self.image.display()
            )));
        }

        Ok(())
    }
}

fn binary_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Board registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BoardsFile {
    #[serde(default)]
    boards: HashMap<String, BoardEntry>,
}

#[derive(Debug, Deserialize)]
struct BoardEntry {
    reset_command: Vec<String>,
}

/// Named registry of per-board reset command lines.
#[derive(Debug, Clone)]
pub struct BoardRegistry {
    boards: HashMap<String, Vec<String>>,
}

impl Default for BoardRegistry {
    fn default() -> Self {
        let mut boards = HashMap::new();
        boards.insert(
            "arduino_101".to_string(),
            vec![
                "openocd".to_string(),
                "-f".to_string(),
                "interface/ftdi/flyswatter2.cfg".to_string(),
                "-f".to_string(),
                "board/quark_se.cfg".to_string(),
                "-c".to_string(),
                "init".to_string(),
                "-c".to_string(),
                "reset halt; resume".to_string(),
                "-c".to_string(),
                "shutdown".to_string(),
            ],
        );
        boards.insert(
            "nrf52".to_string(),
            vec![
                "nrfjprog".to_string(),
                "-f".to_string(),
                "nrf52".to_string(),
                "--reset".to_string(),
            ],
        );
        boards.insert(
            "frdm_k64f".to_string(),
            vec![
                "pyocd".to_string(),
                "commander".to_string(),
                "-c".to_string(),
                "reset".to_string(),
            ],
        );
        Self { boards }
    }
}

impl BoardRegistry {
    /// Parse a boards TOML document. Entries extend and override the
    /// built-in defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: BoardsFile = toml::from_str(content).context("failed to parse boards file")?;
        let mut registry = Self::default();
        for (name, entry) in file.boards {
            registry.boards.insert(name, entry.reset_command);
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read boards file: {}", path.display()))?;
        let registry = Self::from_toml(&content)?;
        info!(path = %path.display(), "loaded board registry");
        Ok(registry)
    }

    /// Try to load the registry from, in order:
    /// 1. The path in the `PTSRUNNER_BOARDS` environment variable.
    /// 2. `/etc/ptsrunner/boards.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("PTSRUNNER_BOARDS") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(registry) => return registry,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PTSRUNNER_BOARDS set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/ptsrunner/boards.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(registry) => return registry,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system boards file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no boards file found, using compiled-in defaults");
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.boards.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<BoardProfile> {
        self.boards.get(name).map(|cmd| BoardProfile {
            name: name.to_string(),
            reset_command: cmd.clone(),
        })
    }
}
