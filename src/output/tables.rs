use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use super::styling::format_seconds;
use crate::queue::{QueueLimitations, QueuePosition, QueuedBuild};
use crate::resilience::{CircuitState, CircuitStats};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn optional_seconds(seconds: Option<f64>) -> String {
    seconds.map_or_else(|| "-".to_string(), format_seconds)
}

pub fn position_cell(position: &QueuePosition) -> Cell {
    if !position.is_queued() {
        Cell::new("left queue").fg(TableColor::Green)
    } else if position.position == 1 {
        Cell::new("1").fg(TableColor::Green)
    } else if position.blocked_by.is_empty() {
        Cell::new(position.position).fg(TableColor::Yellow)
    } else {
        Cell::new(position.position).fg(TableColor::Red)
    }
}

pub fn circuit_state_cell(state: CircuitState) -> Cell {
    match state {
        CircuitState::Closed => Cell::new("closed").fg(TableColor::Green),
        CircuitState::HalfOpen => Cell::new("half-open").fg(TableColor::Yellow),
        CircuitState::Open => Cell::new("open").fg(TableColor::Red),
    }
}

pub fn queued_builds_table(builds: &[QueuedBuild]) -> Table {
    let mut table = create_table();
    table.set_header(vec!["Build", "Configuration", "Branch", "Position", "Web URL"]);
    for build in builds {
        table.add_row(vec![
            Cell::new(&build.build_id),
            Cell::new(&build.build_type_id),
            Cell::new(build.branch_name.as_deref().unwrap_or("<default>")),
            Cell::new(build.queue_position),
            Cell::new(&build.web_url),
        ]);
    }
    table
}

pub fn positions_table(positions: &[QueuePosition]) -> Table {
    let mut table = create_table();
    table.set_header(vec!["Build", "Position", "Estimated wait", "Can move to top", "Blocked by"]);
    for position in positions {
        table.add_row(vec![
            Cell::new(&position.build_id),
            position_cell(position),
            Cell::new(optional_seconds(position.estimated_wait_time)),
            Cell::new(if position.can_move_to_top { "yes" } else { "no" }),
            Cell::new(position.blocked_by.join(", ")),
        ]);
    }
    table
}

pub fn limitations_table(limitations: &QueueLimitations) -> Table {
    let mut table = create_table();
    table.set_header(vec!["Limit", "Value"]);

    let max = limitations
        .max_concurrent_builds
        .map_or_else(|| "unlimited".to_string(), |m| m.to_string());
    let running = if limitations.concurrency_reached() {
        Cell::new(limitations.currently_running).fg(TableColor::Red)
    } else {
        Cell::new(limitations.currently_running).fg(TableColor::Green)
    };
    let agents = if limitations.available_agents == 0 {
        Cell::new(0).fg(TableColor::Red)
    } else {
        Cell::new(limitations.available_agents)
    };

    table.add_row(vec![Cell::new("Configuration"), Cell::new(&limitations.build_type_id)]);
    table.add_row(vec![Cell::new("Max concurrent builds"), Cell::new(max)]);
    table.add_row(vec![Cell::new("Currently running"), running]);
    table.add_row(vec![Cell::new("Queued"), Cell::new(limitations.queued_builds)]);
    table.add_row(vec![Cell::new("Personal builds queued"), Cell::new(limitations.personal_builds_queued)]);
    table.add_row(vec![Cell::new("Compatible agents"), agents]);
    table
}

pub fn circuit_stats_table(stats: &[CircuitStats]) -> Table {
    let mut table = create_table();
    table.set_header(vec!["Endpoint", "State", "Failures", "Last failure"]);
    for entry in stats {
        table.add_row(vec![
            Cell::new(&entry.endpoint),
            circuit_state_cell(entry.state),
            Cell::new(entry.failure_count),
            Cell::new(
                entry
                    .last_failure_time
                    .map_or_else(|| "-".to_string(), |t| t.format("%H:%M:%S").to_string()),
            ),
        ]);
    }
    table
}
