// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Compression formats for checkpoint images.
//!
//! A dump directory is either kept as-is, or packed into a tarball whose
//! extension records the compression used. Streamed shards use the same
//! codecs without the tar layer.

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression as Level;

use crate::error::{CryoError, CryoResult};

/// Supported compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Directory kept uncompressed.
    None,
    /// Plain tarball.
    Tar,
    Gzip,
    Zlib,
    /// Recognised but not available in this build.
    Lz4,
    Zstd,
}

impl Compression {
    /// Parses a user-supplied format name. The empty string means `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "" | "none" => Some(Self::None),
            "tar" => Some(Self::Tar),
            "gzip" | "gz" => Some(Self::Gzip),
            "zlib" => Some(Self::Zlib),
            "lz4" => Some(Self::Lz4),
            "zstd" | "zst" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Parses a format name, failing with `Unimplemented` for unknown or
    /// unavailable formats.
    pub fn parse_supported(name: &str) -> CryoResult<Self> {
        match Self::parse(name) {
            Some(c) if c.is_available() => Ok(c),
            _ => Err(CryoError::unimplemented(format!(
                "unsupported compression format '{}'",
                name
            ))),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tar => "tar",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    pub const fn is_available(&self) -> bool {
        !matches!(self, Self::Lz4)
    }

    /// Whether a dump with this format ends up as a tarball.
    pub const fn is_archive(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Extension appended after `.tar` (or after a shard name).
    pub const fn ext(&self) -> &'static str {
        match self {
            Self::None | Self::Tar => "",
            Self::Gzip => ".gz",
            Self::Zlib => ".zlib",
            Self::Lz4 => ".lz4",
            Self::Zstd => ".zst",
        }
    }

    /// Infers the format from a path's final extension.
    pub fn from_path(path: impl AsRef<Path>) -> CryoResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "gz" | "gzip" => Ok(Self::Gzip),
            "zlib" => Ok(Self::Zlib),
            "lz4" => Ok(Self::Lz4),
            "zst" | "zstd" => Ok(Self::Zstd),
            "tar" => Ok(Self::Tar),
            "" => Ok(Self::None),
            other => Err(CryoError::unimplemented(format!(
                "unsupported compression extension '.{}' in {}",
                other,
                path.display()
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn unavailable(c: Compression) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("compression format '{}' is not available", c),
    )
}

/// A writer that compresses into `W`. Must be [`finish`](Encoder::finish)ed
/// so trailers are written and errors surface.
pub enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zlib(ZlibEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(inner: W, compression: Compression) -> io::Result<Self> {
        Ok(match compression {
            Compression::None | Compression::Tar => Self::Plain(inner),
            Compression::Gzip => Self::Gzip(GzEncoder::new(inner, Level::default())),
            Compression::Zlib => Self::Zlib(ZlibEncoder::new(inner, Level::default())),
            Compression::Zstd => Self::Zstd(zstd::stream::write::Encoder::new(inner, 0)?),
            Compression::Lz4 => return Err(unavailable(compression)),
        })
    }

    pub fn finish(self) -> io::Result<W> {
        let mut inner = match self {
            Self::Plain(w) => w,
            Self::Gzip(e) => e.finish()?,
            Self::Zlib(e) => e.finish()?,
            Self::Zstd(e) => e.finish()?,
        };
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Zlib(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Zlib(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Wraps `inner` in a decompressing reader.
pub fn decoder<'a, R: Read + Send + 'a>(
    inner: R,
    compression: Compression,
) -> io::Result<Box<dyn Read + Send + 'a>> {
    Ok(match compression {
        Compression::None | Compression::Tar => Box::new(inner),
        Compression::Gzip => Box::new(GzDecoder::new(inner)),
        Compression::Zlib => Box::new(ZlibDecoder::new(inner)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(
            BufReader::new(inner),
        )?),
        Compression::Lz4 => return Err(unavailable(compression)),
    })
}

/// Copies `src` into `dst`, compressing on the way. Returns bytes read.
pub fn write_to<R: Read, W: Write>(
    mut src: R,
    dst: W,
    compression: Compression,
) -> io::Result<u64> {
    let mut encoder = Encoder::new(dst, compression)?;
    let n = io::copy(&mut src, &mut encoder)?;
    encoder.finish()?;
    Ok(n)
}

/// Copies `src` into `dst`, decompressing on the way. Returns bytes written.
pub fn read_from<R: Read + Send, W: Write>(
    src: R,
    mut dst: W,
    compression: Compression,
) -> io::Result<u64> {
    let mut decoder = decoder(src, compression)?;
    let n = io::copy(&mut decoder, &mut dst)?;
    dst.flush()?;
    Ok(n)
}

/// Packs the contents of `dir` into a (compressed) tarball written to `dst`.
pub fn pack_dir<W: Write>(dir: &Path, dst: W, compression: Compression) -> io::Result<()> {
    let encoder = Encoder::new(dst, compression)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Extracts a (compressed) tarball read from `src` into `dest`.
pub fn unpack_dir<R: Read + Send>(src: R, dest: &Path, compression: Compression) -> io::Result<()> {
    let decoder = decoder(src, compression)?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_names() {
        assert_eq!(Compression::parse(""), Some(Compression::None));
        assert_eq!(Compression::parse("gz"), Some(Compression::Gzip));
        assert_eq!(Compression::parse("zst"), Some(Compression::Zstd));
        assert_eq!(Compression::parse("brotli"), None);
    }

    #[test]
    fn test_parse_supported_rejects_lz4() {
        let err = Compression::parse_supported("lz4").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Unimplemented);
        assert!(err.to_string().contains("'lz4'"));
        assert!(Compression::parse_supported("bogus").is_err());
        assert_eq!(
            Compression::parse_supported("gzip").unwrap(),
            Compression::Gzip
        );
    }

    #[test]
    fn test_ext_and_inference_agree() {
        for c in [
            Compression::Gzip,
            Compression::Zlib,
            Compression::Zstd,
            Compression::Lz4,
        ] {
            let path = format!("/tmp/ckpt.tar{}", c.ext());
            assert_eq!(Compression::from_path(&path).unwrap(), c);
        }
        assert_eq!(
            Compression::from_path("/tmp/ckpt.tar").unwrap(),
            Compression::Tar
        );
        assert_eq!(
            Compression::from_path("/tmp/img-0").unwrap(),
            Compression::None
        );
        assert!(Compression::from_path("/tmp/ckpt.rar").is_err());
    }

    #[test]
    fn test_stream_codecs() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        for c in [
            Compression::None,
            Compression::Gzip,
            Compression::Zlib,
            Compression::Zstd,
        ] {
            let mut packed = Vec::new();
            let n = write_to(&data[..], &mut packed, c).unwrap();
            assert_eq!(n as usize, data.len());

            let mut unpacked = Vec::new();
            read_from(&packed[..], &mut unpacked, c).unwrap();
            assert_eq!(unpacked, data, "codec {}", c);
        }
    }

    #[test]
    fn test_tar_directory() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("pages-1.img"), b"pages").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/core.img"), b"core").unwrap();

        let mut archive = Vec::new();
        pack_dir(src.path(), &mut archive, Compression::Gzip).unwrap();

        let dest = TempDir::new().unwrap();
        unpack_dir(&archive[..], dest.path(), Compression::Gzip).unwrap();
        assert_eq!(
            std::fs::read(dest.path().join("pages-1.img")).unwrap(),
            b"pages"
        );
        assert_eq!(
            std::fs::read(dest.path().join("sub/core.img")).unwrap(),
            b"core"
        );
    }

    #[test]
    fn test_lz4_encoder_unavailable() {
        let err = Encoder::new(Vec::new(), Compression::Lz4).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
