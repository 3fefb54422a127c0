use crate::cli::{split_location, Command, Opt};
use crate::util;

use anyhow::Result;
use cairn::archive::{load_archive_by_name, ItemStreamReader};
use cairn_core::archive::ItemType;
use prettytable::{cell, row, Table};

/// Lists the archives of a repository, or the items of one archive
pub fn list(options: &Opt) -> Result<i32> {
    let (target, consider_checkpoints) = match &options.command {
        Command::List {
            target,
            consider_checkpoints,
        } => (target, *consider_checkpoints),
        _ => unreachable!(),
    };
    let (repository, archive) = split_location(target);
    let mut session = util::open_session(&repository, false)?;

    match archive {
        None => {
            let archives = session.manifest.list(consider_checkpoints);
            println!("Number of archives in repository: {}", archives.len());
            println!(
                "Repository last modified: {}",
                session.manifest.timestamp().to_rfc2822()
            );
            let mut table = Table::new();
            table.add_row(row!["Name", "Creation Time"]);
            let mut sorted = archives;
            sorted.sort_by(|a, b| a.time.cmp(&b.time));
            for entry in sorted {
                table.add_row(row![entry.name, entry.time.to_rfc2822()]);
            }
            table.printstd();
        }
        Some(name) => {
            let (_, record) =
                load_archive_by_name(&mut session.repo, &session.manifest, &name)?;
            let mut table = Table::new();
            table.add_row(row!["Type", "Mode", "Size", "Path"]);
            let mut items = ItemStreamReader::new(record.item_stream);
            while let Some(item) = items.next_item(&mut session.repo)? {
                let kind = match item.item_type {
                    ItemType::RegularFile => "-",
                    ItemType::Directory => "d",
                    ItemType::Symlink { .. } => "l",
                    ItemType::Hardlink { .. } => "h",
                    ItemType::CharDevice { .. } => "c",
                    ItemType::BlockDevice { .. } => "b",
                    ItemType::Fifo => "p",
                };
                table.add_row(row![
                    kind,
                    format!("{:o}", item.mode),
                    item.size,
                    item.path
                ]);
            }
            table.printstd();
        }
    }
    Ok(0)
}
