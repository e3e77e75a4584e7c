use std::io::Write as _;

use env_logger::Env;

/// Logger setup: terse single-line output, level from RUST_LOG, default
/// info for our crates and warn elsewhere.
pub fn setup() {
    let env = Env::default().default_filter_or("warn,bch_core=info,bcachefs_core=info");

    env_logger::Builder::from_env(env)
        .format(|buf, record| writeln!(buf, "{:<5} {}", record.level(), record.args()))
        .init();
}
