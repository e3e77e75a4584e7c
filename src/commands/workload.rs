use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;
use clap::Parser;
use log::debug;

use bch_core::bkey::SubvolInum;
use bch_core::fs_common::CreateFlags;
use bch_core::image::fs_to_image;
use bch_core::opts::Opts;
use bch_core::trans::{commit_do, BtreeTrans};
use bch_core::vfs::{self, RenameFlags};
use bch_core::Fs;

use crate::commands::{open_fs, write_image};

#[derive(Parser, Debug)]
#[command(
    name = "workload",
    about = "Apply a namespace workload script to an image",
    after_help = "Script operations, one per line:\n\
                  \x20 mkdir <path>              touch <path>\n\
                  \x20 link <path> <newpath>     unlink <path>\n\
                  \x20 rename <src> <dst>        exchange <src> <dst>\n\
                  \x20 whiteout <src> <dst>      subvolume <path>\n\
                  \x20 snapshot <src> <dst> [ro] rmsubvol <path>\n\
                  \x20 cached <dev> <sectors>    ls <path>\n\
                  \x20 stat <path>               path <path>\n\
                  # starts a comment line."
)]
pub struct Cli {
    /// Commands to run (may be given multiple times, before/instead of a
    /// script file)
    #[arg(short = 'e', long = "exec")]
    exec: Vec<String>,

    /// Leave the journal unflushed when saving (simulates a crash)
    #[arg(long)]
    dirty: bool,

    /// Verify accounting after the workload
    #[arg(long)]
    verify: bool,

    /// Image file
    image: String,

    /// Script file of operations
    script: Option<String>,
}

pub fn cmd_workload(argv: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(argv)?;

    let fs = open_fs(&cli.image, Opts::default())?;

    let mut lines: Vec<String> = cli.exec.clone();
    if let Some(script) = &cli.script {
        let text = std::fs::read_to_string(script)
            .with_context(|| format!("reading script '{}'", script))?;
        lines.extend(text.lines().map(|l| l.to_string()));
    }

    for line in &lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        debug!("workload: {}", line);
        run_op(&fs, line).with_context(|| format!("op '{}'", line))?;
    }

    if cli.verify && !fs.verify_accounting_clean() {
        bail!("accounting not clean after workload");
    }

    write_image(&cli.image, &fs_to_image(&fs, !cli.dirty))?;
    Ok(())
}

/// Split "/a/b/c" into its parent directory path and final component.
fn split_parent(path: &str) -> Result<(&str, &str)> {
    let path = path.trim_end_matches('/');
    let idx = path.rfind('/').ok_or_else(|| anyhow!("not an absolute path: {}", path))?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        bail!("not a file path: {}", path);
    }
    Ok((&path[..idx.max(1)], name))
}

const DIR_MODE: u32 = libc::S_IFDIR as u32 | 0o755;
const REG_MODE: u32 = libc::S_IFREG as u32 | 0o644;

fn rename_op(fs: &Fs, src: &str, dst: &str, flags: RenameFlags) -> Result<()> {
    let (src_dir, src_name) = split_parent(src)?;
    let (dst_dir, dst_name) = split_parent(dst)?;
    let src_dir = vfs::resolve_path(fs, src_dir)?;
    let dst_dir = vfs::resolve_path(fs, dst_dir)?;
    vfs::rename(fs, &src_dir, &dst_dir, src_name, dst_name, flags)?;
    Ok(())
}

fn run_op(fs: &Fs, line: &str) -> Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();

    match words.as_slice() {
        ["mkdir", path] => {
            let (dir, name) = split_parent(path)?;
            let dir = vfs::resolve_path(fs, dir)?;
            vfs::create(fs, &dir, Some(name), 0, 0, DIR_MODE, 0,
                        SubvolInum::new(0, 0), CreateFlags::empty())?;
        }
        ["touch", path] => {
            let (dir, name) = split_parent(path)?;
            let dir = vfs::resolve_path(fs, dir)?;
            vfs::create(fs, &dir, Some(name), 0, 0, REG_MODE, 0,
                        SubvolInum::new(0, 0), CreateFlags::empty())?;
        }
        ["link", src, dst] => {
            let inode = vfs::resolve_path(fs, src)?;
            let (dir, name) = split_parent(dst)?;
            let dir = vfs::resolve_path(fs, dir)?;
            vfs::link(fs, &dir, &inode, name)?;
        }
        ["unlink", path] | ["rmdir", path] => {
            let (dir, name) = split_parent(path)?;
            let dir = vfs::resolve_path(fs, dir)?;
            vfs::unlink(fs, &dir, name, false)?;
        }
        ["rename", src, dst] => rename_op(fs, src, dst, RenameFlags::empty())?,
        ["exchange", src, dst] => rename_op(fs, src, dst, RenameFlags::EXCHANGE)?,
        ["whiteout", src, dst] => rename_op(fs, src, dst, RenameFlags::WHITEOUT)?,
        ["subvolume", path] => {
            let (dir, name) = split_parent(path)?;
            let dir = vfs::resolve_path(fs, dir)?;
            vfs::create(fs, &dir, Some(name), 0, 0, DIR_MODE, 0,
                        SubvolInum::new(0, 0), CreateFlags::SUBVOL)?;
        }
        ["snapshot", src, dst] | ["snapshot", src, dst, "ro"] => {
            let src_inode = vfs::resolve_path(fs, src)?;
            if src_inode.inode().bi_subvol == 0 {
                bail!("{} is not a subvolume", src);
            }
            let (dir, name) = split_parent(dst)?;
            let dir = vfs::resolve_path(fs, dir)?;

            let mut flags = CreateFlags::SNAPSHOT;
            if words.len() == 4 {
                flags |= CreateFlags::SNAPSHOT_RO;
            }
            vfs::create(fs, &dir, Some(name), 0, 0, DIR_MODE, 0,
                        SubvolInum::new(src_inode.inum.subvol, 0), flags)?;
        }
        ["rmsubvol", path] => {
            let (dir, name) = split_parent(path)?;
            let dir = vfs::resolve_path(fs, dir)?;
            if let Some(inum) = vfs::unlink(fs, &dir, name, true)? {
                // drop cached inodes belonging to the dead subvolume
                let snapshots: Vec<u32> = fs
                    .vfs_inodes
                    .lock()
                    .iter()
                    .filter(|i| i.inum.subvol == inum.subvol)
                    .map(|i| i.snapshot)
                    .collect();
                vfs::evict_subvolume_inodes(fs, &snapshots);
            }
        }
        ["cached", dev, sectors] => {
            let dev: u8 = dev.parse()?;
            let sectors: i64 = sectors.parse()?;
            let trans = BtreeTrans::new(fs);
            commit_do(&trans, |t| {
                bch_core::accounting::update::mod_dev_cached_sectors(t, dev, sectors, false)
            })?;
        }
        ["ls", path] => {
            let dir = vfs::resolve_path(fs, path)?;
            let trans = BtreeTrans::new(fs);
            let entries = bch_core::trans::lockrestart_do(&trans, |t| {
                bch_core::dirent::dirent_list(t, dir.inum)
            })?;
            for d in entries {
                println!("{:<10} {:?} {}", d.d_type.to_string(), d.target, d.name);
            }
        }
        ["stat", path] => {
            let inode = vfs::resolve_path(fs, path)?;
            let bi = inode.inode();
            let mtime = DateTime::from_timestamp_nanos(bi.bi_mtime as i64);
            println!(
                "{}:{} mode {:o} nlink {} size {} depth {} mtime {}",
                inode.inum.subvol,
                inode.inum.inum,
                bi.bi_mode,
                bi.nlink_get(),
                bi.bi_size,
                bi.bi_depth,
                mtime.format("%Y-%m-%d %H:%M:%S"),
            );
        }
        ["path", path] => {
            let inode = vfs::resolve_path(fs, path)?;
            println!("{}", vfs::path_of(fs, inode.inum)?);
        }
        _ => bail!("unknown operation"),
    }
    Ok(())
}
