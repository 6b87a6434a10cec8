use std::process;

use vhd::ImageBuilder;

use crate::style::*;

pub(crate) fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.len() < 3 {
        eprintln!("Usage: vhd-tool create <fixed|dynamic> <path> <size> [sector-size]");
        process::exit(1);
    }

    let path = &args[1];
    let size = parse_size(&args[2])?;
    if size == 0 {
        return Err("size must be greater than zero".into());
    }

    let mut builder = match args[0].as_str() {
        "fixed" => ImageBuilder::fixed(size),
        "dynamic" => ImageBuilder::dynamic(size),
        other => return Err(format!("Unknown disk type: {other} (expected fixed or dynamic)").into()),
    };
    if let Some(sector_size) = args.get(3) {
        let sector_size = u32::try_from(parse_size(sector_size)?)
            .map_err(|_| format!("Sector size too large: {sector_size}"))?;
        builder = builder.sector_size(sector_size);
    }

    let image = builder.create(path)?;
    let footer = image.footer();

    header(&format!("Created: {path}"));
    kv_highlight("Disk type", &footer.disk_type.to_string());
    kv("Size", &format!("{} ({} bytes)", format_size(footer.current_size), format_commas(footer.current_size)));
    kv("Geometry (C/H/S)", &footer.geometry.to_string());
    kv("Unique ID", &footer.unique_id.to_string());
    if let Some(sparse) = image.sparse() {
        kv("Sector size", &format_size(sparse.sector_size()));
        kv("Table entries", &format_commas(sparse.allocation_table().len() as u64));
    }
    println!();

    Ok(())
}
