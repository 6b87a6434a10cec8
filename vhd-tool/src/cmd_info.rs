use std::process;

use vhd::format::{host_os_name, tag_string, NULL_OFFSET};
use vhd::{DiskType, Features, Footer, Image, ImageOptions};

use crate::style::*;

pub(crate) fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: vhd-tool info <vhd-file>");
        process::exit(1);
    }

    let path = &args[0];
    // Open leniently so damaged checksums are reported instead of fatal
    let options = ImageOptions {
        verify_checksums: false,
        read_only: true,
    };
    let mut image = Image::open_path(path, options)?;
    let footer = image.footer().clone();

    header(&format!("VHD: {path}"));

    section("Footer");
    kv_highlight("Disk type", &footer.disk_type.to_string());
    kv("Current size", &format!("{} ({} bytes)", format_size(footer.current_size), format_commas(footer.current_size)));
    kv("Original size", &format_size(footer.original_size));
    kv("Geometry (C/H/S)", &footer.geometry.to_string());
    kv("Format version", &footer.format_version.to_string());
    kv("Features", &feature_names(footer.features));
    kv("Creator", &format!(
        "{} {} on {}",
        tag_string(footer.creator_application).trim_end(),
        footer.creator_version,
        host_os_name(footer.creator_host_os)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:#010x}", footer.creator_host_os)),
    ));
    kv("Timestamp", &format!("{} (VHD epoch seconds)", format_commas(footer.timestamp as u64)));
    kv("Unique ID", &footer.unique_id.to_string());
    kv("Saved state", if footer.saved_state != 0 { "yes" } else { "no" });
    if footer.data_offset != NULL_OFFSET {
        kv("Header offset", &format_commas(footer.data_offset));
    }
    match footer.verify_checksum() {
        Ok(()) => kv("Checksum", &format!("{:#010x} ok", footer.checksum)),
        Err(e) => kv_warn("Checksum", &e.to_string()),
    }
    if footer.is_short {
        kv_warn("Footer layout", footer_layout(&footer));
    } else {
        kv("Footer layout", footer_layout(&footer));
    }

    let Some(sparse) = image.sparse() else {
        println!();
        return Ok(());
    };
    let table = sparse.allocation_table();
    let dyn_header = sparse.header();

    section("Dynamic header");
    kv("Header version", &dyn_header.header_version.to_string());
    kv("Table offset", &format_commas(dyn_header.table_offset));
    kv("Table entries", &format_commas(dyn_header.max_table_entries as u64));
    kv("Sector size", &format_size(sparse.sector_size()));
    kv("Blocks per sector", &format_commas(sparse.blocks_per_sector()));
    kv("Bitmap blocks", &sparse.bitmap_blocks().to_string());
    match dyn_header.verify_checksum() {
        Ok(()) => kv("Checksum", &format!("{:#010x} ok", dyn_header.checksum)),
        Err(e) => kv_warn("Checksum", &e.to_string()),
    }

    section("Allocation");
    let allocated = table.allocated_count() as u64;
    let total = table.len() as u64;
    kv("Allocated sectors", &format!("{} / {}", format_commas(allocated), format_commas(total)));
    kv("Allocated data", &format_size(allocated * sparse.sector_size()));
    if total > 0 {
        kv_highlight("Utilization", &format!("{:.1}%", allocated as f64 * 100.0 / total as f64));
    }

    if footer.disk_type == DiskType::Differencing {
        let parent_name = dyn_header.parent_name();
        let parent_id = dyn_header.parent_unique_id;
        let parent_timestamp = dyn_header.parent_timestamp;
        let locators: Vec<_> = dyn_header
            .parent_locators()
            .map(|(index, locator)| (index, *locator))
            .collect();

        section("Parent");
        kv("Name", &parent_name);
        kv("Unique ID", &parent_id.to_string());
        kv("Timestamp", &format_commas(parent_timestamp as u64));

        for (index, locator) in locators {
            let path = image
                .parent_locator_data(index)
                .ok()
                .and_then(|data| locator.decode_path(&data))
                .unwrap_or_else(|| format!("{} bytes at {}", locator.data_length, locator.data_offset));
            kv(&format!("Locator {index} ({})", locator.platform()), &path);
        }
    }
    println!();

    Ok(())
}

fn feature_names(features: Features) -> String {
    let names: Vec<_> = features.iter_names().map(|(name, _)| name.to_lowercase()).collect();
    let unknown = features.bits() & !Features::all().bits();
    match (names.is_empty(), unknown) {
        (true, 0) => "none".to_string(),
        (_, 0) => names.join(", "),
        _ => format!("{} (+{unknown:#x})", names.join(", ")),
    }
}

fn footer_layout(footer: &Footer) -> &'static str {
    if footer.is_short {
        "short (511 bytes, shifted by one)"
    } else {
        "standard (512 bytes)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_layout() {
        let mut footer = Footer::new(DiskType::Dynamic, 1 << 20);
        assert_eq!(footer_layout(&footer), "standard (512 bytes)");

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&footer.to_bytes()[..511]);
        footer = Footer::parse(&shifted, 0).unwrap();
        assert_eq!(footer_layout(&footer), "short (511 bytes, shifted by one)");
    }

    #[test]
    fn test_feature_names() {
        assert_eq!(feature_names(Features::empty()), "none");
        assert_eq!(feature_names(Features::RESERVED), "reserved");
        assert_eq!(
            feature_names(Features::from_bits_retain(0x12)),
            "reserved (+0x10)"
        );
    }
}
