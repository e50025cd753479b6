mod progress;
mod styling;
mod tables;

use anyhow::Result;
use serde::Serialize;

pub use progress::BuildProgressView;
pub use styling::{bright_green, dim, magenta_bold};
pub use tables::{circuit_stats_table, limitations_table, positions_table, queued_builds_table};

/// Prints the buildpilot banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("🚦 buildpilot"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("TeamCity build queue orchestration")
    );
}

/// Prints a value as JSON on stdout.
pub fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}
