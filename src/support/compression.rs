//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! Provides a façade around compression and decompression of snapshot blobs.
//!
//! A compressed blob starts with a single byte identifying the scheme,
//! followed by the scheme's own framing.

use std::io::{self, BufRead, Read, Write};

/// Extends the `Write` trait to have a `finish()` method.
pub trait FinishWrite: Write {
    /// Perform any finishing operations on this object.
    fn finish(&mut self) -> io::Result<()>;
}

impl<W: Write> FinishWrite for zstd::Encoder<W> {
    fn finish(&mut self) -> io::Result<()> {
        self.do_finish()
    }
}

impl<W: Write> FinishWrite for io::BufWriter<W> {
    fn finish(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<W: FinishWrite + ?Sized> FinishWrite for Box<W> {
    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

/// Supported compression schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    /// Stored as-is. Only used for very small snapshots.
    None = 0,
    /// ZStandard compression.
    Zstd = 1,
}

impl Compression {
    pub const DEFAULT_FOR_SNAPSHOT: Self = Compression::Zstd;

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Wrap `reader` to decompress according to this scheme.
    pub fn decompressor<'a>(
        self,
        reader: impl Read + 'a,
    ) -> io::Result<Box<dyn BufRead + 'a>> {
        match self {
            Compression::None => Ok(box_r(io::BufReader::new(reader))),
            Compression::Zstd => {
                Ok(box_r(io::BufReader::new(zstd::Decoder::new(reader)?)))
            }
        }
    }

    /// Wrap `writer` to compress according to this scheme.
    pub fn compressor<'a>(
        self,
        writer: impl Write + 'a,
    ) -> io::Result<Box<dyn FinishWrite + 'a>> {
        match self {
            Compression::None => Ok(box_w(io::BufWriter::new(writer))),
            Compression::Zstd => Ok(box_w(zstd::Encoder::new(writer, 5)?)),
        }
    }
}

/// Run `write` against a compressor for `compression`, returning the full
/// tagged blob.
pub fn compress_with(
    compression: Compression,
    write: impl FnOnce(&mut dyn Write) -> io::Result<()>,
) -> io::Result<Vec<u8>> {
    let mut blob = vec![compression as u8];
    {
        let mut compressor = compression.compressor(&mut blob)?;
        write(&mut compressor)?;
        compressor.finish()?;
    }
    Ok(blob)
}

/// Open a tagged blob produced by `compress_with()` for reading.
pub fn decompressor_for<'a>(blob: &'a [u8]) -> io::Result<Box<dyn BufRead + 'a>> {
    let (&tag, payload) = blob.split_first().ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "empty blob")
    })?;
    let compression = Compression::from_tag(tag).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown compression scheme {}", tag),
        )
    })?;
    compression.decompressor(payload)
}

fn box_r<'a>(r: impl BufRead + 'a) -> Box<dyn BufRead + 'a> {
    Box::new(r)
}

fn box_w<'a>(w: impl FinishWrite + 'a) -> Box<dyn FinishWrite + 'a> {
    Box::new(w)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tagged_blob_is_readable() {
        for &compression in &[Compression::None, Compression::Zstd] {
            let blob = compress_with(compression, |w| {
                w.write_all(b"hello hello hello hello")
            })
            .unwrap();
            assert_eq!(compression as u8, blob[0]);

            let mut out = String::new();
            decompressor_for(&blob)
                .unwrap()
                .read_to_string(&mut out)
                .unwrap();
            assert_eq!("hello hello hello hello", out);
        }
    }

    #[test]
    fn bad_blobs_rejected() {
        assert!(decompressor_for(&[]).is_err());
        assert!(decompressor_for(&[99, 1, 2, 3]).is_err());
    }
}
