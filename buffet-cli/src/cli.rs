use std::path::PathBuf;

use anyhow::Context;
use buffet::{BuffetOptions, BuffetRuntime, OwnerId};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::commands::{create::CreateArgs, get::GetArgs, images::ImagesArgs, rm::RmArgs};

/// Buffet - on-demand VM sessions viewed in the browser
#[derive(Parser, Debug)]
#[command(name = "buffet", author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot a VM session for an owner
    Create(CreateArgs),

    /// Destroy one or more sessions
    Rm(RmArgs),

    /// Show the running session of an owner
    Get(GetArgs),

    /// Print the number of running sessions
    Count,

    /// List every session row, including in-flight ones
    #[command(alias = "ls")]
    List,

    /// List the image catalogue
    Images(ImagesArgs),

    /// Terminate every recorded session left behind by a previous run
    Sweep,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Buffet home directory
    #[arg(long, global = true, env = "BUFFET_HOME")]
    pub home: Option<PathBuf>,

    /// TOML options file
    #[arg(long, global = true, env = "BUFFET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl GlobalFlags {
    /// Options from `--config`, with `--home` taking precedence over the file.
    pub fn options(&self) -> anyhow::Result<BuffetOptions> {
        let mut options = match &self.config {
            Some(path) => BuffetOptions::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BuffetOptions::default(),
        };
        if let Some(home) = &self.home {
            options.home_dir = std::path::absolute(home)
                .with_context(|| format!("resolving {}", home.display()))?;
        }
        Ok(options)
    }

    pub fn create_runtime(&self) -> anyhow::Result<BuffetRuntime> {
        Ok(BuffetRuntime::new(self.options()?)?)
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

pub fn parse_owner(raw: &str) -> anyhow::Result<OwnerId> {
    OwnerId::new(raw).with_context(|| format!("invalid owner id {:?}", raw))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
