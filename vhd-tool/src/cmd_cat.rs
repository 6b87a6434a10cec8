use std::io::{self, Write};
use std::process;

use vhd::{Image, ImageOptions, ReadStream, StreamOptions};

use crate::style::parse_size;

pub(crate) fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: vhd-tool cat <vhd-file> [start] [end]");
        process::exit(1);
    }

    let image_options = ImageOptions {
        read_only: true,
        ..Default::default()
    };
    let image = Image::open_path(&args[0], image_options)?;
    let start = args.get(1).map(|s| parse_size(s)).transpose()?.unwrap_or(0);
    let end = args.get(2).map(|s| parse_size(s)).transpose()?;
    if end.is_some_and(|end| end < start) {
        return Err(format!("end {} is before start {start}", args[2]).into());
    }

    let options = StreamOptions {
        start,
        end,
        ..Default::default()
    };
    let mut stream = ReadStream::new(image, options);
    let mut stdout = io::stdout().lock();
    while let Some(chunk) = stream.next_chunk()? {
        stdout.write_all(&chunk)?;
    }
    stdout.flush()?;

    Ok(())
}
