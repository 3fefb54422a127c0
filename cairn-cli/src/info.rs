use crate::cli::{split_archive_location, Command, Opt};
use crate::util;

use anyhow::Result;
use cairn::archive::load_archive_by_name;
use prettytable::{cell, row, Table};

/// Shows detailed information about one archive
pub fn info(options: &Opt) -> Result<i32> {
    let archive = match &options.command {
        Command::Info { archive } => archive,
        _ => unreachable!(),
    };
    let (repository, name) = split_archive_location(archive)?;
    let mut session = util::open_session(&repository, false)?;
    let (id, record) = load_archive_by_name(&mut session.repo, &session.manifest, &name)?;

    println!("Archive: {}", record.name);
    println!("Archive id: {}", id);
    if !record.comment.is_empty() {
        println!("Comment: {}", record.comment);
    }
    println!("Hostname: {}", record.hostname);
    println!("Username: {}", record.username);
    println!("Started: {}", record.start.to_rfc2822());
    println!("Finished: {}", record.end.to_rfc2822());
    if !record.command_line.is_empty() {
        println!("Command line: {}", record.command_line);
    }

    let mut table = Table::new();
    table.add_row(row!["", "Bytes"]);
    table.add_row(row!["Original size", record.stats.original_size]);
    table.add_row(row!["Compressed size", record.stats.compressed_size]);
    table.add_row(row!["Deduplicated size", record.stats.deduplicated_size]);
    table.printstd();
    println!("Files: {}", record.stats.nfiles);
    println!("Item stream chunks: {}", record.item_stream.len());
    Ok(0)
}
