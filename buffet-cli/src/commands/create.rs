use clap::Args;

use buffet::ProvisioningOutcome;

use crate::cli::{GlobalFlags, parse_owner, print_json};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Owner the session is created for
    #[arg(long)]
    pub owner: String,

    /// Catalogue image to boot (the `iso` field of index.json)
    pub image: String,
}

pub async fn execute(args: CreateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let owner = parse_owner(&args.owner)?;
    let runtime = global.create_runtime()?;

    let provisioned = runtime.create(&owner, &args.image).await?;

    if global.is_json() {
        return print_json(&provisioned);
    }

    let view = &provisioned.view;
    println!("{}", view.id);
    println!("port: {}", view.public_port);
    match &view.display_credential {
        Some(password) => println!("password: {}", password),
        None => println!("password: <none>"),
    }
    if let ProvisioningOutcome::SucceededDegraded(reason) = &provisioned.outcome {
        eprintln!("Warning: {}", reason);
    }
    Ok(())
}
