use std::path::Path;

use anyhow::{Context, Result};
use clap::{Command, CommandFactory};

use bch_core::image::{image_open, Image};
use bch_core::opts::Opts;
use bch_core::Fs;

pub mod check;
pub mod format;
pub mod list_journal;
pub mod usage;
pub mod workload;

pub use check::cmd_check;
pub use format::cmd_format;
pub use list_journal::cmd_list_journal;
pub use usage::cmd_usage;
pub use workload::cmd_workload;

/// Build the full command tree for help output.
pub fn build_cli() -> Command {
    Command::new("bcachefs-core")
        .subcommand(format::Cli::command().name("format"))
        .subcommand(usage::Cli::command().name("usage"))
        .subcommand(check::Cli::command().name("check"))
        .subcommand(list_journal::Cli::command().name("list-journal"))
        .subcommand(workload::Cli::command().name("workload"))
}

/// Read a filesystem image file.
pub fn read_image(path: &str) -> Result<Image> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading image '{}'", path))?;
    serde_json::from_str(&data).with_context(|| format!("parsing image '{}'", path))
}

/// Write a filesystem image file.
pub fn write_image(path: &str, img: &Image) -> Result<()> {
    let data = serde_json::to_string_pretty(img)?;
    std::fs::write(Path::new(path), data)
        .with_context(|| format!("writing image '{}'", path))
}

/// Read and mount an image.
pub fn open_fs(path: &str, opts: Opts) -> Result<Fs> {
    let img = read_image(path)?;
    image_open(img, opts).with_context(|| format!("mounting image '{}'", path))
}
