use serde_json::json;

use crate::cli::{GlobalFlags, print_json};

pub async fn execute(global: &GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let swept = runtime.sweep().await?;

    if global.is_json() {
        return print_json(&json!({ "swept": swept }));
    }
    println!("Swept {} session(s)", swept);
    Ok(())
}
