use serde_json::json;

use crate::cli::{GlobalFlags, print_json};

pub fn execute(global: &GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let count = runtime.count()?;
    let max = runtime.options().max_sessions;

    if global.is_json() {
        return print_json(&json!({ "count": count, "max": max }));
    }
    println!("{}", count);
    Ok(())
}
