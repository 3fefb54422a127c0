/*!
The `cairn` binary provides a lightweight wrapper over the core `cairn`
engine, exposing a simple set of commands for working with repositories.

Exit codes: 0 on success, 1 when the operation completed with warnings,
2 on error. A process killed by signal N exits with 128+N, courtesy of
the operating system.
*/
mod cli;

mod check;
mod create;
mod delete;
mod extract;
mod info;
mod init;
mod keycmd;
mod list;
mod maintain;
mod prune;
mod recreate;
mod util;

use cli::{Command, Opt};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

fn main() {
    let options = Opt::from_args();
    let default_level = match options.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // A machine that cannot round-trip its own crypto must not write
    // backups; CAIRN_SELFTEST=disabled skips this for constrained targets
    if std::env::var("CAIRN_SELFTEST").map_or(true, |v| v != "disabled") {
        if let Err(err) = cairn_core::repository::self_test() {
            eprintln!("Error: crypto self test failed: {}", err);
            std::process::exit(2);
        }
    }

    let result = match options.command.clone() {
        Command::Init { .. } => init::init(&options),
        Command::Create { .. } => create::create(&options),
        Command::Extract { .. } => extract::extract(&options),
        Command::List { .. } => list::list(&options),
        Command::Info { .. } => info::info(&options),
        Command::Delete { .. } => delete::delete(&options),
        Command::Prune { .. } => prune::prune(&options),
        Command::Check { .. } => check::check(&options),
        Command::Compact { .. } => maintain::compact(&options),
        Command::Recreate { .. } => recreate::recreate(&options),
        Command::Key(_) => keycmd::key(&options),
        Command::TamUpgrade { .. } => maintain::tam_upgrade(&options),
        Command::BreakLock { .. } => maintain::break_lock(&options),
        Command::Serve => maintain::serve(&options),
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            2
        }
    };
    std::process::exit(code);
}
