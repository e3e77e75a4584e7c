use anyhow::Result;
use clap::Parser;

use bch_core::accounting::DiskAccountingPos;
use bch_core::bkey::KeyValue;
use bch_core::btree::BtreeId;
use bch_core::journal::JournalKey;

use crate::commands::read_image;

#[derive(Parser, Debug)]
#[command(name = "list-journal", about = "List pending journal keys in an image")]
pub struct Cli {
    /// Only accounting keys
    #[arg(short = 'a', long = "accounting")]
    accounting_only: bool,

    /// Image file
    image: String,
}

fn key_to_text(jk: &JournalKey) -> String {
    let pos = if jk.btree == BtreeId::Accounting {
        DiskAccountingPos::from_bpos(jk.k.p).to_string()
    } else {
        format!("{:?}", jk.k.p)
    };

    let val = match &jk.k.v {
        KeyValue::Accounting(a) => {
            let d: Vec<String> = a.d.iter().map(|v| v.to_string()).collect();
            d.join(" ")
        }
        KeyValue::Inode(i) => format!("inode {} nlink={}", i.bi_inum, i.nlink_get()),
        KeyValue::Dirent(d) => format!("dirent {:?} -> {:?}", d.name, d.target),
        KeyValue::Subvolume(s) => {
            format!("subvol root={} snapshot={}", s.root_inode, s.snapshot)
        }
        KeyValue::Xattr(x) => format!("xattr {:?} ({} bytes)", x.name, x.val.len()),
        KeyValue::Whiteout => "whiteout".to_string(),
        KeyValue::Deleted => "deleted".to_string(),
    };

    format!(
        "  {:>6}:{:<4} {:<12} {:<44} {}",
        jk.k.version.journal_seq,
        jk.k.version.offset,
        jk.btree.to_string(),
        pos,
        val
    )
}

pub fn cmd_list_journal(argv: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(argv)?;
    let img = read_image(&cli.image)?;

    println!(
        "journal seq {}, {} pending keys{}:",
        img.journal_seq,
        img.journal.len(),
        if img.clean { " (clean)" } else { "" }
    );

    let mut last_seq = 0;
    for jk in &img.journal {
        if cli.accounting_only && !jk.is_accounting() {
            continue;
        }
        if jk.k.version.journal_seq != last_seq {
            last_seq = jk.k.version.journal_seq;
            println!("commit {}:", last_seq);
        }
        println!("{}", key_to_text(jk));
    }
    Ok(())
}
