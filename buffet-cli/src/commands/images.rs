use clap::Args;
use comfy_table::{Table, presets::UTF8_FULL};

use crate::cli::{GlobalFlags, print_json};

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Output as JSON, logos included (same as `--format json`)
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: ImagesArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;

    if args.json || global.is_json() {
        return print_json(&runtime.images());
    }

    let catalogue = runtime.catalogue();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "IMAGE", "NAME", "VERSION", "DESKTOP", "ARCH", "PRESENT",
    ]);

    for entry in catalogue.entries() {
        let present = runtime.layout().image_path(entry.image_ref()).is_file();
        table.add_row(vec![
            entry.iso.clone(),
            entry.name.clone(),
            entry.version.clone().unwrap_or_default(),
            entry.desktop.clone().unwrap_or_default(),
            entry.architecture.clone(),
            if present { "yes" } else { "no" }.to_string(),
        ]);
    }

    println!("{}", table);
    Ok(())
}
