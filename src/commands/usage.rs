use anyhow::Result;
use clap::Parser;

use bch_core::accounting::gc::{fs_accounting_read, fs_replicas_usage_read};
use bch_core::accounting::DiskAccountingPos;
use bch_core::fs_usage::{data_type_is_empty, DataType, DATA_TYPE_NR};
use bch_core::opts::Opts;

use crate::commands::open_fs;
use crate::util::{fmt_count_human, fmt_sectors_human};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "snake_case")]
enum Field {
    Replicas,
    Btree,
    Compression,
    Snapshots,
    Devices,
}

#[derive(Parser, Debug)]
#[command(name = "usage", about = "Display detailed filesystem usage")]
pub struct Cli {
    /// Comma-separated list of fields
    #[arg(short = 'f', long = "fields", value_delimiter = ',', value_enum)]
    fields: Vec<Field>,

    /// Print all accounting fields
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Human-readable units
    #[arg(short = 'H', long = "human-readable")]
    human_readable: bool,

    /// Image files
    images: Vec<String>,
}

pub fn cmd_usage(argv: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(argv)?;

    let fields: Vec<Field> = if cli.all {
        vec![Field::Replicas, Field::Btree, Field::Compression, Field::Snapshots, Field::Devices]
    } else if cli.fields.is_empty() {
        vec![Field::Replicas, Field::Devices]
    } else {
        cli.fields.clone()
    };

    for path in &cli.images {
        fs_usage_to_text(path, &fields, cli.human_readable)?;
    }
    Ok(())
}

fn sectors(v: u64, human: bool) -> String {
    if human {
        fmt_sectors_human(v)
    } else {
        v.to_string()
    }
}

fn fs_usage_to_text(path: &str, fields: &[Field], human: bool) -> Result<()> {
    let opts = Opts { read_only: true, ..Opts::default() };
    let fs = open_fs(path, opts)?;
    let has = |f: Field| fields.contains(&f);

    println!("Filesystem: {}", fs.sb.read().uuid);

    let s = fs.usage_summary();
    println!("{:<18}{}", "Size:", sectors(s.capacity, human));
    println!("{:<18}{}", "Used:", sectors(s.used, human));
    println!("{:<18}{}", "Inodes:", fmt_count_human(s.nr_inodes));
    println!("{:<18}{}", "Available inodes:", fmt_count_human(s.avail_inodes));

    let base = fs.usage.read();
    println!();
    println!("{:<12}{}", "hidden:", sectors(base.hidden, human));
    println!("{:<12}{}", "btree:", sectors(base.btree, human));
    println!("{:<12}{}", "data:", sectors(base.data, human));
    println!("{:<12}{}", "cached:", sectors(base.cached, human));
    println!("{:<12}{}", "reserved:", sectors(base.reserved, human));

    if has(Field::Replicas) {
        let entries = fs_replicas_usage_read(&fs);
        if !entries.is_empty() {
            println!();
            println!("Replicas:");
            for (r, v) in entries {
                println!("  {:<40}{}", r.to_string(), sectors(v, human));
            }
        }
    }

    if has(Field::Btree) || has(Field::Compression) || has(Field::Snapshots) {
        let entries = fs_accounting_read(&fs, |pos| match pos {
            DiskAccountingPos::Btree { .. } => has(Field::Btree),
            DiskAccountingPos::Compression { .. } => has(Field::Compression),
            DiskAccountingPos::Snapshot { .. } => has(Field::Snapshots),
            _ => false,
        });
        if !entries.is_empty() {
            println!();
            for (pos, val) in entries {
                let counters: Vec<String> = val.d.iter().map(|d| d.to_string()).collect();
                println!("{:<40}{}", pos.to_string(), counters.join(" "));
            }
        }
    }

    if has(Field::Devices) {
        let nr_devs = fs.sb.read().members.len();
        for dev in 0..nr_devs as u8 {
            println!();
            println!(
                "Device {} (bucket size {}):",
                dev,
                sectors(fs.sb.read().member(dev).unwrap().bucket_size as u64, human)
            );
            println!("  {:<14}{:>12}{:>12}{:>12}", "", "buckets", "sectors", "fragmented");
            for t in 0..DATA_TYPE_NR as u8 {
                let Some(ty) = bch_core::fs_usage::data_type_from_u8(t) else { continue };
                let u = fs.dev_usage_read(dev, ty);
                if u == [0; 3] && data_type_is_empty(ty) && ty != DataType::Free {
                    continue;
                }
                println!(
                    "  {:<14}{:>12}{:>12}{:>12}",
                    ty.to_string(),
                    u[0],
                    sectors(u[1], human),
                    sectors(u[2], human)
                );
            }
        }
    }

    println!();
    Ok(())
}
