use std::process;

use vhd::format::SECTOR_FREE;
use vhd::{Image, ImageOptions};

use crate::style::*;

pub(crate) fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: vhd-tool bat <vhd-file>");
        process::exit(1);
    }

    let path = &args[0];
    let options = ImageOptions {
        read_only: true,
        ..Default::default()
    };
    let image = Image::open_path(path, options)?;
    let sparse = image
        .sparse()
        .ok_or_else(|| format!("{} disks have no allocation table", image.disk_type()))?;
    let table = sparse.allocation_table();

    header(&format!("Allocation table: {path}"));
    println!();
    println!(
        "  {DIM}{:>8}  {:>12}  {:>14}  {:>14}{RESET}",
        "Sector", "Entry", "Logical", "Physical"
    );
    println!("  {DIM}{}{RESET}", "-".repeat(56));

    let sector_size = sparse.sector_size();
    for (sector, entry) in table.iter().enumerate() {
        if entry == SECTOR_FREE {
            continue;
        }
        let logical = sector as u64 * sector_size;
        let physical = sparse.sector_address(sector as u64).unwrap_or_default();
        println!(
            "  {:>8}  {:>12}  {:>14}  {GREEN}{:>14}{RESET}",
            sector,
            format!("{entry:#010x}"),
            format_commas(logical),
            format_commas(physical),
        );
    }

    println!();
    println!(
        "  {DIM}{} of {} sector(s) allocated, {} each{RESET}",
        format_commas(table.allocated_count() as u64),
        format_commas(table.len() as u64),
        format_size(sector_size),
    );
    println!();

    Ok(())
}
