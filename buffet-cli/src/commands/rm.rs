use clap::Args;

use buffet::Requester;

use crate::cli::{GlobalFlags, parse_owner};

/// Identity used for `--admin` removals when no owner is given.
const OPERATOR: &str = "operator";

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Owner performing the removal
    #[arg(long, required_unless_present = "admin")]
    pub owner: Option<String>,

    /// Remove sessions regardless of who owns them
    #[arg(long)]
    pub admin: bool,

    /// ID of the session(s) to remove
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

pub async fn execute(args: RmArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let owner = parse_owner(args.owner.as_deref().unwrap_or(OPERATOR))?;
    let requester = if args.admin {
        Requester::admin(owner)
    } else {
        Requester::user(owner)
    };
    let runtime = global.create_runtime()?;

    let mut errors = Vec::new();
    let mut success_count = 0;

    for target in args.targets {
        if let Err(e) = runtime.destroy(&requester, &target).await {
            eprintln!("Error removing session '{}': {}", target, e);
            errors.push(format!("{}: {}", target, e));
        } else {
            println!("{}", target);
            success_count += 1;
        }
    }

    if !errors.is_empty() {
        let error_summary = if success_count > 0 {
            format!(
                "Failed to remove {} of {} session(s)",
                errors.len(),
                errors.len() + success_count
            )
        } else {
            format!("Failed to remove all {} session(s)", errors.len())
        };

        anyhow::bail!("{}\nErrors:\n  {}", error_summary, errors.join("\n  "));
    }
    Ok(())
}
