mod commands;
mod logging;
mod util;

use std::process::{ExitCode, Termination};

/// Print main usage, with commands grouped by category. Descriptions are
/// pulled from the clap command tree (build_cli).
fn bcachefs_core_usage() {
    let cmd = commands::build_cli();

    let groups: &[(&str, &[&str])] = &[
        ("Filesystem images:", &["format", "workload"]),
        ("Reporting:", &["usage", "list-journal"]),
        ("Repair:", &["check"]),
    ];

    println!("bcachefs-core - copy-on-write filesystem core testbed");
    println!("usage: bcachefs-core <command> [<args>]\n");

    for (heading, names) in groups {
        println!("{heading}");
        for name in *names {
            let Some(sub) = cmd.find_subcommand(name) else { continue };
            let about = sub.get_about().map(|s| s.to_string()).unwrap_or_default();
            println!("  {:<26}{about}", name);
        }
        println!();
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        println!("missing command");
        bcachefs_core_usage();
        return ExitCode::from(1);
    }

    logging::setup();

    match args[1].as_str() {
        "--help" | "help" => {
            bcachefs_core_usage();
            ExitCode::SUCCESS
        }
        "format" => commands::cmd_format(args[1..].to_vec()).report(),
        "usage" => commands::cmd_usage(args[1..].to_vec()).report(),
        "check" | "fsck" => commands::cmd_check(args[1..].to_vec()).report(),
        "list-journal" | "list_journal" => {
            commands::cmd_list_journal(args[1..].to_vec()).report()
        }
        "workload" => commands::cmd_workload(args[1..].to_vec()).report(),
        cmd => {
            println!("Unknown command {cmd}");
            bcachefs_core_usage();
            ExitCode::from(1)
        }
    }
}
