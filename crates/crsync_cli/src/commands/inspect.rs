//! Inspect command implementation.

use crsync_protocol::RoomId;
use crsync_store::{inspect_room, RoomSummary};
use std::fmt::Write as _;
use std::path::Path;

/// Runs the inspect command.
pub fn run(dir: &Path, room: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("No room directory at {:?}", dir).into());
    }
    let room = RoomId::new(room)?;
    let summary = inspect_room(dir, &room)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            print!("{}", render_text(&summary));
        }
    }

    Ok(())
}

/// Formats a summary for the terminal.
pub fn render_text(summary: &RoomSummary) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_summary(&mut out, summary);
    out
}

fn write_summary(out: &mut String, s: &RoomSummary) -> std::fmt::Result {
    writeln!(out, "crsync Room Inspection")?;
    writeln!(out, "======================")?;
    writeln!(out)?;
    writeln!(out, "Room:    {}", s.room)?;
    writeln!(out, "Site:    {}", s.site_id)?;
    writeln!(out, "Schema:  {}", s.schema.as_deref().unwrap_or("(none)"))?;
    writeln!(out)?;
    writeln!(out, "Log:")?;
    writeln!(out, "  Size:         {}", format_size(s.log_bytes))?;
    writeln!(out, "  Records:      {}", s.records)?;
    writeln!(out, "  Changesets:   {}", s.changesets)?;
    writeln!(out, "  Local writes: {}", s.local_writes)?;
    if s.torn_bytes > 0 {
        writeln!(out, "  Torn tail:    {} bytes", s.torn_bytes)?;
    }
    writeln!(out)?;
    writeln!(out, "State:")?;
    writeln!(out, "  DB version: {}", s.db_version)?;
    writeln!(out, "  Cells:      {}", s.cells)?;

    if !s.peers.is_empty() {
        writeln!(out)?;
        writeln!(out, "Peers:")?;
        for (site, seen) in &s.peers {
            writeln!(out, "  {site}  last seen {seen}")?;
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
