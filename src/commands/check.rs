use std::sync::atomic::Ordering;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use bch_core::accounting::gc::{
    accounting_gc_free, accounting_mem_gc, gc_accounting_done, gc_accounting_start,
};
use bch_core::accounting::update::disk_accounting_mod;
use bch_core::accounting::DiskAccountingPos;
use bch_core::bkey::KeyValue;
use bch_core::btree::BtreeId;
use bch_core::image::fs_to_image;
use bch_core::opts::{FixErrors, Opts};
use bch_core::trans::{lockrestart_do, BtreeTrans};
use bch_core::Fs;

use crate::commands::{open_fs, write_image};

#[derive(Parser, Debug)]
#[command(name = "check", about = "Check and repair filesystem accounting")]
pub struct Cli {
    /// Fix errors without asking
    #[arg(short = 'y', long = "fix")]
    fix: bool,

    /// Report errors only
    #[arg(short = 'n', long = "no-fix")]
    no_fix: bool,

    /// Image file
    image: String,
}

pub fn cmd_check(argv: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(argv)?;

    let fix_errors = if cli.no_fix { FixErrors::No } else { FixErrors::Yes };
    let opts = Opts { fix_errors, ..Opts::default() };

    // mount runs the accounting replay, which reports and (per policy)
    // repairs unregistered replicas entries
    let fs = open_fs(&cli.image, opts)?;
    fs.write_buffer_flush();

    // parallel-shadow recount
    gc_accounting_start(&fs)?;
    recount(&fs)?;
    gc_accounting_done(&fs)?;
    accounting_gc_free(&fs);
    accounting_mem_gc(&fs);

    let clean = fs.verify_accounting_clean();
    let seen = fs.fsck_errors_seen.load(Ordering::Relaxed);
    let fixed = fs.fsck_errors_fixed.load(Ordering::Relaxed);

    if seen == 0 && clean {
        info!("{}: clean", cli.image);
    } else {
        println!("{}: {} errors, {} fixed", cli.image, seen, fixed);
    }

    if fixed > 0 && !cli.no_fix {
        write_image(&cli.image, &fs_to_image(&fs, true))?;
    }

    if (seen > fixed || !clean) && !cli.no_fix {
        bail!("errors not fixed");
    }
    Ok(())
}

/// Rebuild the shadow counters from the sources of truth: the accounting
/// tree for counters whose producers live outside this testbed, and a real
/// recount of the inode keys for nr_inodes.
fn recount(fs: &Fs) -> Result<()> {
    let trans = BtreeTrans::new(fs);

    for k in fs.btree.keys(BtreeId::Accounting) {
        let KeyValue::Accounting(v) = &k.v else { continue };
        let pos = DiskAccountingPos::from_bpos(k.p);
        if matches!(pos, DiskAccountingPos::NrInodes | DiskAccountingPos::Unknown(_)) {
            continue;
        }
        lockrestart_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &v.d, true))?;
    }

    let nr_inodes = recount_nr_inodes(fs);
    lockrestart_do(&trans, |t| {
        disk_accounting_mod(t, DiskAccountingPos::NrInodes, &[nr_inodes], true)
    })?;
    Ok(())
}

/// Count inode keys the way the commit-time triggers do: +1 per inode key,
/// -1 per whiteout shadowing an inode inherited from an ancestor snapshot.
fn recount_nr_inodes(fs: &Fs) -> i64 {
    let snapshots = fs.snapshots.read();
    let mut n = 0i64;

    for k in fs.btree.keys(BtreeId::Inodes) {
        match k.v {
            KeyValue::Inode(_) => n += 1,
            KeyValue::Whiteout => {
                if fs.btree.key_in_ancestor_snapshot(BtreeId::Inodes, k.p, &snapshots) {
                    n -= 1;
                }
            }
            _ => (),
        }
    }
    n
}
