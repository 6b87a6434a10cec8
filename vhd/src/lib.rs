//! VHD - Virtual Hard Disk image library
//!
//! Reads and writes Microsoft VHD images: Fixed, Dynamic and (metadata
//! only) Differencing disks.
//!
//! # Features
//!
//! - **Codec** for the footer, dynamic header, parent locators and block
//!   allocation table, byte exact on round-trip
//! - **Sparse engine** mapping logical byte ranges onto allocated sectors,
//!   zero-filling holes and allocating on write
//! - **Streams** for sequential reads and writes
//! - **Create** new Fixed and Dynamic images
//!
//! # Example
//!
//! ```no_run
//! use vhd::{Image, ImageOptions, ReadStream, Result, StreamOptions};
//!
//! fn main() -> Result<()> {
//!     let mut image = Image::open_path("disk.vhd", ImageOptions::default())?;
//!     println!("{} disk, {} bytes", image.disk_type(), image.size());
//!
//!     // First block via the block-device API
//!     let mbr = image.read_blocks(0, 1)?;
//!     assert_eq!(mbr.len(), 512);
//!
//!     // Whole disk as a stream
//!     let mut stream = ReadStream::new(image, StreamOptions::default());
//!     let mut out = std::fs::File::create("disk.raw")?;
//!     std::io::copy(&mut stream, &mut out)?;
//!
//!     Ok(())
//! }
//! ```

pub mod bat;
pub mod builder;
pub mod checksum;
pub mod error;
pub mod fixed;
pub mod footer;
pub mod format;
pub mod geometry;
pub mod header;
pub mod image;
mod io;
pub mod locator;
pub mod sparse;
pub mod stream;

pub use bat::AllocationTable;
pub use builder::ImageBuilder;
pub use error::{Result, VhdError};
pub use footer::Footer;
pub use format::{DiskType, Features, PlatformCode, Version};
pub use geometry::DiskGeometry;
pub use header::Header;
pub use image::{is_vhd, open, Image, ImageOptions};
pub use locator::Locator;
pub use sparse::SparseDisk;
pub use stream::{ReadStream, StreamOptions, WriteStream};
