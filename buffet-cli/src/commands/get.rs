use clap::Args;

use crate::cli::{GlobalFlags, parse_owner, print_json};

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Owner whose session to show
    #[arg(long)]
    pub owner: String,
}

pub fn execute(args: GetArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let owner = parse_owner(&args.owner)?;
    let runtime = global.create_runtime()?;
    let view = runtime.get(&owner)?;

    if global.is_json() {
        return print_json(&view);
    }

    println!("id:       {}", view.id);
    println!("owner:    {}", view.owner_id);
    println!("image:    {}", view.image_ref);
    println!("port:     {}", view.public_port);
    println!(
        "password: {}",
        view.display_credential.as_deref().unwrap_or("<none>")
    );
    if let Some(meta) = &view.catalogue_metadata {
        let version = meta.version.as_deref().unwrap_or("");
        println!("system:   {} {}", meta.name, version);
    }
    Ok(())
}
