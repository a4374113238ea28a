//! rtccal CLI - Command-line tool for calibrating serial-attached RTC oscillators.
//!
//! ## Features
//!
//! - Full three-window calibration run (1 minute, 1 hour, 6 hours)
//! - Per-window settle overrides and window selection for quick checks
//! - Live echo of everything the board prints
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use console::style;
use env_logger::Env;
use log::debug;
use rtccal::port::{DEFAULT_BAUD, DEFAULT_TIMEOUT};
use rtccal::{
    CalibrationEvent, CalibrationPlan, CalibrationSummary, Calibrator, NativePort,
    NativePortEnumerator, PortEnumerator, SerialConfig, Session, SystemClock, WindowOutcome,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod config;

use config::{Config, seconds};

/// Exit code for a run cancelled with Ctrl-C.
const EXIT_CANCELLED: i32 = 130;

/// rtccal - Calibrate a board's RTC oscillator against host time.
///
/// Resets the board, sets its clock, times three windows of increasing
/// length and programs the measured frequency offset after each one. A full
/// run takes a little over seven hours.
///
/// Environment variables:
///   RTCCAL_BAUD              - Baud rate (default: 115200)
///   RTCCAL_COMMAND_TIMEOUT   - Seconds to wait for each reply (default: 30)
///   RTCCAL_CONFIG            - Path to a configuration file
#[derive(Parser, Debug)]
#[command(name = "rtccal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial device the board is attached to (e.g. /dev/ttyUSB0, COM3).
    #[arg(value_name = "PORT", required_unless_present = "list_ports")]
    port: Option<String>,

    /// Baud rate of the calibration firmware.
    #[arg(short, long, env = "RTCCAL_BAUD")]
    baud: Option<u32>,

    /// Seconds to wait for each expected reply.
    #[arg(long, value_name = "SECS", env = "RTCCAL_COMMAND_TIMEOUT")]
    command_timeout: Option<f64>,

    /// Override a window's settle time (e.g. 1M=45). Repeatable.
    #[arg(long = "settle", value_name = "NAME=SECS", value_parser = parse_settle)]
    settle: Vec<(String, f64)>,

    /// Only run the named window (1M, 1H, 6H). Repeatable.
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,

    /// Clear the RTC voltage-low flag before calibrating.
    #[arg(long)]
    clear_volt_low: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH", env = "RTCCAL_CONFIG")]
    config_path: Option<PathBuf>,

    /// List available serial ports and exit.
    #[arg(long)]
    list_ports: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,
}

/// CLI-level failures that are not library errors.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
}

/// Parse a settle override in format "NAME=SECS".
fn parse_settle(s: &str) -> Result<(String, f64), String> {
    let (name, secs) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid format: '{s}'. Expected 'NAME=SECS' (e.g., '1M=45')"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Missing window name in '{s}'"));
    }
    let secs: f64 = secs
        .trim()
        .parse()
        .map_err(|e| format!("Invalid seconds in '{s}': {e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("Invalid seconds in '{s}': must be a non-negative number"));
    }
    Ok((name.to_string(), secs))
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<rtccal::Error>() {
        Some(rtccal::Error::Interrupted) => EXIT_CANCELLED,
        _ => 1,
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout, usage errors to stderr.
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        },
    };

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "rtccal v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        let code = exit_code_for(&err);
        if code == EXIT_CANCELLED {
            eprintln!("\n{} Cancelled by user", style("✗").red().bold());
        } else {
            eprintln!("\n{} {err:#}", style("Error:").red().bold());
        }
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list_ports {
        return cmd_list_ports();
    }

    let port_name = cli
        .port
        .as_deref()
        .ok_or_else(|| CliError::Usage("a serial port is required".into()))?;

    let config = Config::load(cli.config_path.as_deref());
    let serial = serial_config(cli, &config, port_name)?;
    let mut session_config = config.session_config()?;
    if let Some(secs) = cli.command_timeout {
        session_config = session_config.with_command_timeout(seconds(secs, "--command-timeout")?);
    }
    let plan = build_plan(cli, &config)?;

    install_ctrlc_handler()?;

    if !cli.quiet {
        print_banner(&serial, &plan);
    }

    let port = NativePort::open(&serial).with_context(|| format!("failed to open {port_name}"))?;
    let session = Session::new(port, SystemClock::new()).with_config(session_config);
    let mut calibrator = Calibrator::new(session, plan);

    let summary = calibrator
        .run(|event| report_event(&event))
        .context("calibration aborted")?;

    print_summary(&summary);
    Ok(())
}

/// Resolve the serial settings: flags and environment, then config, then defaults.
fn serial_config(cli: &Cli, config: &Config, port_name: &str) -> Result<SerialConfig> {
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD);
    let read_timeout = match config.connection.read_timeout_secs {
        Some(secs) => seconds(secs, "connection.read_timeout_secs")?,
        None => DEFAULT_TIMEOUT,
    };
    let write_timeout = match config.connection.write_timeout_secs {
        Some(secs) => seconds(secs, "connection.write_timeout_secs")?,
        None => DEFAULT_TIMEOUT,
    };
    Ok(SerialConfig::new(port_name, baud)
        .with_timeout(read_timeout)
        .with_write_timeout(write_timeout))
}

/// Build the window plan: config settle overrides first, flags on top.
fn build_plan(cli: &Cli, config: &Config) -> Result<CalibrationPlan> {
    let mut plan = CalibrationPlan::new().with_clear_voltage_low(cli.clear_volt_low);

    let overrides = config
        .windows
        .iter()
        .map(|(name, secs)| (name.as_str(), *secs))
        .chain(cli.settle.iter().map(|(name, secs)| (name.as_str(), *secs)));
    for (name, secs) in overrides {
        plan = plan.with_settle_override(name, seconds(secs, &format!("settle time of {name}"))?)?;
    }

    if !cli.only.is_empty() {
        plan = plan.only(&cli.only)?;
    }
    Ok(plan)
}

/// Route Ctrl-C to the library's cancellation check.
fn install_ctrlc_handler() -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler failed")?;
    rtccal::set_interrupt_checker(move || interrupted.load(Ordering::SeqCst));
    Ok(())
}

fn print_banner(serial: &SerialConfig, plan: &CalibrationPlan) {
    let names: Vec<_> = plan.windows().iter().map(|w| w.name).collect();
    let total = plan.total_duration().as_secs();
    eprintln!(
        "{} Calibrating on {} at {} baud",
        style("→").cyan(),
        style(&serial.port_name).cyan().bold(),
        serial.baud_rate
    );
    eprintln!(
        "  Windows: {} (about {}h{:02}m of timing)",
        names.join(", "),
        total / 3600,
        (total % 3600) / 60
    );
}

fn report_event(event: &CalibrationEvent<'_>) {
    match event {
        CalibrationEvent::WindowStarted(window) => {
            eprintln!(
                "\n{} Timing {} window ({}s)",
                style("→").cyan(),
                style(window.name).bold(),
                window.nominal_secs
            );
        },
        CalibrationEvent::WindowMeasured(outcome) => print_outcome(outcome),
        CalibrationEvent::OffsetProgrammed(outcome) => match outcome.millihertz {
            Some(mhz) => println!("  {:<10}{mhz} mHz", "offset"),
            None => println!("  {:<10}{}", "offset", style("not reported").dim()),
        },
    }
}

fn print_outcome(outcome: &WindowOutcome) {
    let drift = &outcome.drift;
    println!();
    println!("{}", style(format!("== {} window ==", outcome.window)).bold());
    println!(
        "  {:<10}{}",
        "start",
        outcome.timing.start.format("%Y-%m-%d %H:%M:%S%.6f")
    );
    println!(
        "  {:<10}{}",
        "end",
        outcome.timing.end.format("%Y-%m-%d %H:%M:%S%.6f")
    );
    println!("  {:<10}{} ticks", "duration", drift.measured_ticks);
    println!("  {:<10}{} ticks", "expected", drift.expected_ticks);
    let diff = format!("{:+} ticks ({:+.3} ppm)", drift.diff, drift.ppm());
    let diff = if drift.diff == 0 {
        style(diff).green()
    } else {
        style(diff).yellow()
    };
    println!("  {:<10}{diff}", "diff");
}

fn print_summary(summary: &CalibrationSummary) {
    eprintln!(
        "\n{} Calibration complete, device clock set to {}",
        style("✓").green().bold(),
        summary.final_clock.format("%Y-%m-%d %H:%M:%S")
    );
    for outcome in &summary.outcomes {
        eprintln!(
            "  {:<3} diff {:>+7} ticks",
            outcome.window, outcome.drift.diff
        );
    }
}

/// List ports command implementation.
fn cmd_list_ports() -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("failed to list serial ports")?;

    eprintln!("{}", style("Available serial ports:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    }
    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        println!("{}{vid_pid}{product}", port.name);
    }
    Ok(())
}
