//! `tail -F` across many log files at once, one color per file.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use owo_colors::{AnsiColors, OwoColorize};
use tracing_subscriber::EnvFilter;

use tailmux::TailMux;

/// Colors handed out to files in registration order.
const PALETTE: [AnsiColors; 12] = [
    AnsiColors::Green,
    AnsiColors::Yellow,
    AnsiColors::Blue,
    AnsiColors::Magenta,
    AnsiColors::Cyan,
    AnsiColors::Red,
    AnsiColors::BrightGreen,
    AnsiColors::BrightYellow,
    AnsiColors::BrightBlue,
    AnsiColors::BrightMagenta,
    AnsiColors::BrightCyan,
    AnsiColors::BrightRed,
];

#[derive(Debug, Parser)]
#[command(name = "tailmux", version, about = "Follow appends and rotations across many log files as one colored stream.")]
struct Cli {
    /// Log files to follow, as repeated paths or one comma-separated list.
    #[arg(required = true, value_name = "FILES", value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Log rotation/watch diagnostics to stderr.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "tailmux=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tailmux: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> tailmux::Result<()> {
    let mut mux = TailMux::new()?;

    let mut colors = HashMap::new();
    for (idx, path) in cli.files.iter().enumerate() {
        let registered = mux.add_file(path).await?;
        colors.insert(registered, PALETTE[idx % PALETTE.len()]);
    }

    let mut out = std::io::stdout();
    loop {
        let line = tokio::select! {
            line = mux.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };

        let color = colors
            .get(line.source())
            .copied()
            .unwrap_or(AnsiColors::Default);
        let rendered = format!("{} >>> {}", line.source().display(), line.text());
        if writeln!(out, "{}", rendered.color(color)).is_err() {
            // Downstream pipe closed; nothing left to write to.
            break;
        }
        let _ = out.flush();
    }

    Ok(())
}
