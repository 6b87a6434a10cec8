//! Sequential stream adapters over an image
//!
//! `ReadStream` pulls the disk contents in chunks of at most
//! `high_water_mark` bytes from an advancing cursor; `WriteStream` pushes
//! data the same way. Both can wrap an image that is not open yet, in
//! which case the first pull or push opens it.

use std::io::{self, Read, Seek, Write};
use std::mem;

use crate::error::{Result, VhdError};
use crate::image::{Image, ImageOptions};

/// Default chunk size (64 KiB)
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Options for stream adapters
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Largest chunk transferred per pull or push
    pub high_water_mark: usize,
    /// Logical position the cursor starts at
    pub start: u64,
    /// Exclusive end position, `None` for the disk size
    pub end: Option<u64>,
    /// Close the image once the stream completes
    pub auto_close: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            start: 0,
            end: None,
            auto_close: true,
        }
    }
}

enum Source<F> {
    /// File waiting to be opened on first use
    Pending(F, ImageOptions),
    Open(Image<F>),
    /// An open attempt failed
    Failed,
}

impl<F: Read + Seek> Source<F> {
    fn image(&mut self) -> Result<&mut Image<F>> {
        if let Source::Pending(..) = self {
            if let Source::Pending(file, options) = mem::replace(self, Source::Failed) {
                *self = Source::Open(Image::open_with_options(file, options)?);
            }
        }
        match self {
            Source::Open(image) => Ok(image),
            _ => Err(VhdError::Closed),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Source::Open(image) = self {
            if image.is_open() {
                image.close()?;
            }
        }
        Ok(())
    }

    fn into_image(self) -> Option<Image<F>> {
        match self {
            Source::Open(image) => Some(image),
            _ => None,
        }
    }
}

/// Reads an image front to back
pub struct ReadStream<F> {
    source: Source<F>,
    options: StreamOptions,
    position: u64,
    bytes_read: u64,
    ended: bool,
}

impl<F: Read + Seek> ReadStream<F> {
    /// Stream an opened image
    pub fn new(image: Image<F>, options: StreamOptions) -> Self {
        Self::with_source(Source::Open(image), options)
    }

    /// Stream a file that is opened as an image on the first read
    pub fn from_file(file: F, image_options: ImageOptions, options: StreamOptions) -> Self {
        Self::with_source(Source::Pending(file, image_options), options)
    }

    fn with_source(source: Source<F>, options: StreamOptions) -> Self {
        let options = StreamOptions {
            high_water_mark: options.high_water_mark.max(1),
            ..options
        };
        ReadStream {
            position: options.start,
            source,
            options,
            bytes_read: 0,
            ended: false,
        }
    }

    /// Pull the next chunk, `None` once the end is reached
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.options.high_water_mark];
        let n = self.read_into(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.ended || buf.is_empty() {
            return Ok(0);
        }

        let position = self.position;
        let end = self.options.end;
        let high_water_mark = self.options.high_water_mark;

        let image = self.source.image()?;
        let bound = end.map_or(image.size(), |end| end.min(image.size()));
        if position >= bound {
            self.finish()?;
            return Ok(0);
        }

        let len = (bound - position).min(buf.len().min(high_water_mark) as u64) as usize;
        image.read_at(position, &mut buf[..len])?;
        self.position += len as u64;
        self.bytes_read += len as u64;

        if self.position >= bound {
            self.finish()?;
        }
        Ok(len)
    }

    fn finish(&mut self) -> Result<()> {
        self.ended = true;
        if self.options.auto_close {
            self.source.close()?;
        }
        Ok(())
    }

    /// Bytes delivered so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Logical position of the next read
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Recover the image, `None` if it was never opened
    pub fn into_image(self) -> Option<Image<F>> {
        self.source.into_image()
    }
}

impl<F: Read + Seek> Read for ReadStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(io::Error::from)
    }
}

/// Writes into an image from an advancing cursor
pub struct WriteStream<F> {
    source: Source<F>,
    options: StreamOptions,
    position: u64,
    bytes_written: u64,
}

impl<F: Read + Write + Seek> WriteStream<F> {
    /// Write into an opened image
    pub fn new(image: Image<F>, options: StreamOptions) -> Self {
        Self::with_source(Source::Open(image), options)
    }

    /// Write into a file that is opened as an image on the first write
    pub fn from_file(file: F, image_options: ImageOptions, options: StreamOptions) -> Self {
        Self::with_source(Source::Pending(file, image_options), options)
    }

    fn with_source(source: Source<F>, options: StreamOptions) -> Self {
        let options = StreamOptions {
            high_water_mark: options.high_water_mark.max(1),
            ..options
        };
        WriteStream {
            position: options.start,
            source,
            options,
            bytes_written: 0,
        }
    }

    /// Write up to `high_water_mark` bytes of `data`, returning the count
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<usize> {
        let mut len = data.len().min(self.options.high_water_mark);
        if let Some(end) = self.options.end {
            len = len.min(end.saturating_sub(self.position) as usize);
        }
        if len == 0 {
            return Ok(0);
        }

        let position = self.position;
        self.source.image()?.write_at(position, &data[..len])?;
        self.position += len as u64;
        self.bytes_written += len as u64;
        Ok(len)
    }

    /// Flush the image, closing it when `auto_close` is set
    pub fn finish(&mut self) -> Result<()> {
        if let Source::Open(image) = &mut self.source {
            if image.is_open() {
                image.flush()?;
            }
        }
        if self.options.auto_close {
            self.source.close()?;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Logical position of the next write
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Recover the image, `None` if it was never opened
    pub fn into_image(self) -> Option<Image<F>> {
        self.source.into_image()
    }
}

impl<F: Read + Write + Seek> Write for WriteStream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.source {
            Source::Open(image) if image.is_open() => image.flush().map_err(io::Error::from),
            _ => Ok(()),
        }
    }
}
