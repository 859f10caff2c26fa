use chrono::{DateTime, Utc};
use comfy_table::{Table, presets::UTF8_FULL};

use crate::cli::{GlobalFlags, print_json};

pub fn execute(global: &GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let sessions = runtime.list()?;

    if global.is_json() {
        return print_json(&sessions);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "ID", "OWNER", "IMAGE", "SLOT", "PORT", "STATUS", "CREATED",
    ]);

    for session in sessions {
        table.add_row(vec![
            session.id.short().to_string(),
            session.owner_id.to_string(),
            session.image_ref,
            session.slot.to_string(),
            session.public_port.to_string(),
            session.status.to_string(),
            format_age(session.created_at),
        ]);
    }

    println!("{}", table);
    Ok(())
}

/// Relative age, e.g. "3 minutes ago".
fn format_age(created_at: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(created_at);

    if elapsed.num_seconds() < 60 {
        format!("{} seconds ago", elapsed.num_seconds().max(0))
    } else if elapsed.num_minutes() < 60 {
        format!("{} minutes ago", elapsed.num_minutes())
    } else if elapsed.num_hours() < 24 {
        format!("{} hours ago", elapsed.num_hours())
    } else {
        format!("{} days ago", elapsed.num_days())
    }
}
