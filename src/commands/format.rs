use anyhow::{bail, Result};
use clap::Parser;

use bch_core::fs::Fs;
use bch_core::image::fs_to_image;
use bch_core::opts::Opts;
use bch_core::sb::Member;

use crate::commands::write_image;
use crate::util::parse_human_size;

#[derive(Parser, Debug)]
#[command(name = "format", about = "Create a new filesystem image")]
pub struct Cli {
    /// Number of member devices
    #[arg(long, default_value_t = 1)]
    devices: u8,

    /// Bucket size per device (bytes, human sizes accepted)
    #[arg(long, default_value = "4k")]
    bucket_size: String,

    /// Buckets per device
    #[arg(long, default_value_t = 1024)]
    nbuckets: u64,

    /// Assumed average inode footprint for available-inode estimates
    #[arg(long, default_value_t = 64)]
    avg_inode_bytes: u32,

    /// Image file to create
    image: String,
}

pub fn cmd_format(argv: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(argv)?;

    if cli.devices == 0 {
        bail!("at least one device required");
    }
    let bucket_bytes = parse_human_size(&cli.bucket_size)?;
    if bucket_bytes < 512 || bucket_bytes % 512 != 0 {
        bail!("bucket size must be a multiple of 512");
    }

    let members = (0..cli.devices)
        .map(|_| Member {
            bucket_size: (bucket_bytes >> 9) as u32,
            nbuckets: cli.nbuckets,
            first_bucket: 1,
        })
        .collect();

    let opts = Opts {
        avg_inode_bytes: cli.avg_inode_bytes,
        ..Opts::default()
    };

    let fs = Fs::format(members, opts)?;
    let uuid = fs.sb.read().uuid;
    write_image(&cli.image, &fs_to_image(&fs, true))?;

    println!("initialized {}: {} devices, {} buckets each", uuid, cli.devices, cli.nbuckets);
    Ok(())
}
