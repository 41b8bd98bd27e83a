use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ptsrunner::config::{BoardRegistry, IutTarget, RunConfig};
use ptsrunner::error::RunError;

/// Default control port of a PTS automation engine.
const DEFAULT_ENGINE_PORT: u16 = 65000;

const EXIT_VALIDATION: i32 = 2;
const EXIT_INTERRUPT: i32 = 14;
const EXIT_FAILURE: i32 = 16;

#[derive(Parser)]
#[command(name = "ptsrunner", about = "PTS automation client", version, long_about = None)]
struct Cli {
    /// IP address of a PTS automation server; repeat for multi-engine runs
    #[arg(short = 'i', long = "ip-addr", required = true, value_name = "ADDR")]
    ip_addr: Vec<String>,

    /// Local IP address of the PTS automation client
    #[arg(short = 'l', long = "local-addr")]
    local_addr: Option<String>,

    /// PTS workspace to use for testing, resolved on the server side
    /// (a .pqw6 path there, or a bundled name such as zephyr-hci)
    workspace: String,

    /// Kernel image to test, normally a zephyr.elf file. Passed to QEMU, or
    /// used to locate board reset assets when running on hardware
    kernel_image: PathBuf,

    /// Run BTP communication over this TTY instead of QEMU
    #[arg(short = 't', long = "tty-file")]
    tty_file: Option<PathBuf>,

    /// Bluetooth device address of the IUT
    #[arg(short = 'a', long = "bd-addr")]
    bd_addr: Option<String>,

    /// Enable the PTS maximum logging, equivalent to 'Run (Debug Logs)'
    /// in the PTS GUI
    #[arg(short = 'd', long = "debug-logs")]
    debug_logs: bool,

    /// DUT board; selects the reset command run before each test case.
    /// Without it the DUT is not reset
    #[arg(short = 'b', long)]
    board: Option<String>,

    /// Name of a test case to run; profile group names (GAP, GATT, GATTS,
    /// GATTC, L2CAP, SM, MESH) select whole groups. Repeatable
    #[arg(short = 'c', long = "test-cases", value_name = "NAME")]
    test_cases: Vec<String>,

    /// Name of a test case to exclude; accepts the same group names.
    /// Repeatable
    #[arg(short = 'e', long = "excluded", value_name = "NAME")]
    excluded: Vec<String>,

    /// Maximum repeat count per failed test case
    #[arg(short = 'r', long = "retry", default_value_t = 0)]
    retry: u32,

    /// Save test case verdicts in TestCase.db
    #[arg(short = 's', long, hide = true)]
    store: bool,
}

fn parse_engine_addr(raw: &str) -> Result<SocketAddr, RunError> {
    let with_port = if raw.contains(':') {
        raw.to_string()
    } else {
        format!("{raw}:{DEFAULT_ENGINE_PORT}")
    };
    with_port
        .parse()
        .map_err(|_| RunError::Config(format!("invalid server address: {raw}")))
}

fn build_config(cli: &Cli) -> Result<RunConfig, RunError> {
    let engine_addrs = cli
        .ip_addr
        .iter()
        .map(|raw| parse_engine_addr(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let board = match &cli.board {
        Some(name) => {
            let registry = BoardRegistry::load_or_default();
            let board = registry.get(name).ok_or_else(|| {
                RunError::Config(format!(
                    "unknown board {name}; supported boards: {}",
                    registry.names().join(", ")
                ))
            })?;
            Some(board)
        }
        None => None,
    };

    let target = match &cli.tty_file {
        Some(tty) => IutTarget::Tty(tty.clone()),
        None => IutTarget::Qemu,
    };

    let store_table = cli.store.then(|| {
        format!(
            "zephyr_{}",
            cli.board.as_deref().unwrap_or("none")
        )
    });

    let config = RunConfig {
        engine_addrs,
        local_addr: cli.local_addr.clone(),
        workspace: cli.workspace.clone(),
        image: cli.kernel_image.clone(),
        target,
        board,
        bd_addr: cli.bd_addr.clone(),
        include: cli.test_cases.clone(),
        exclude: cli.excluded.clone(),
        retry_limit: cli.retry,
        max_logging: cli.debug_logs,
        store_table,
    };
    config.validate()?;
    Ok(config)
}

/// Effective UID from /proc; root privileges are not needed and stay
/// refused so a stray reset command cannot do system-level damage.
fn effective_uid() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("Uid:"))?;
    line.split_whitespace().nth(2)?.parse().ok()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug_logs { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if effective_uid() == Some(0) {
        eprintln!("Please do not run this program as root.");
        std::process::exit(EXIT_VALIDATION);
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_VALIDATION);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping run");
                cancel.cancel();
            }
        });
    }

    match ptsrunner::run(config, cancel.clone()).await {
        Ok(report) => {
            println!("\n{}", report.render());
            println!("Bye!");
            if cancel.is_cancelled() {
                std::process::exit(EXIT_INTERRUPT);
            }
        }
        Err(e) => {
            eprintln!("run failed: {e:#}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}
