#![deny(clippy::all)]

use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use packenv_core::{CondaMetaOracle, ProgressSink};

mod cli;

use cli::PackenvCli;

fn main() -> ExitCode {
    if cfg!(windows) {
        eprintln!("packenv currently supports Linux and macOS only.");
        return ExitCode::FAILURE;
    }
    let cli = PackenvCli::parse();
    init_tracing(cli.verbose);

    let opts = cli.to_options();
    let progress = StderrProgress::new(cli.quiet);
    match packenv_core::pack(&opts, &CondaMetaOracle, &progress) {
        Ok(report) => {
            for warning in &report.warnings {
                eprintln!("packenv ▸ warning: {warning}");
            }
            if !cli.quiet {
                eprintln!(
                    "packenv ▸ packed {} file(s) into {}",
                    report.files,
                    report.output.display()
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("packenv ▸ error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = format!("packenv={level},packenv_cli={level},packenv_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Counter rendered on stderr while the driver streams entries. Only the
/// driver thread calls in; the mutex just keeps the state tidy.
struct StderrProgress {
    enabled: bool,
    state: Mutex<(usize, usize)>,
}

impl StderrProgress {
    fn new(quiet: bool) -> Self {
        let enabled = !quiet
            && io::stderr().is_terminal()
            && std::env::var("PACKENV_PROGRESS").map(|v| v != "0").unwrap_or(true);
        Self {
            enabled,
            state: Mutex::new((0, 0)),
        }
    }

    fn render(&self, current: usize, total: usize) {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2Kpackenv ▸ [{current}/{total}]");
        let _ = stderr.flush();
    }
}

impl ProgressSink for StderrProgress {
    fn begin(&self, total: usize) {
        let mut state = self.state.lock().expect("progress lock");
        *state = (0, total);
    }

    fn advance(&self, _path: &str) {
        if !self.enabled {
            return;
        }
        let (current, total) = {
            let mut state = self.state.lock().expect("progress lock");
            state.0 += 1;
            *state
        };
        if current % 16 == 0 || current == total {
            self.render(current, total);
        }
    }

    fn finish(&self) {
        if self.enabled {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(b"\r\x1b[2K");
            let _ = stderr.flush();
        }
    }
}
