use std::io::{Read, Write};

use bytes::BytesMut;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::transport::config::CompressorType;

pub trait Compressor: Send + Sync + 'static {
    fn compress(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn decompress(&self, buf: &mut BytesMut) -> anyhow::Result<()>;
}

pub fn compressor_for(compressor_type: CompressorType) -> Box<dyn Compressor> {
    match compressor_type {
        CompressorType::None => Box::new(NoCompression),
        CompressorType::Deflate => Box::new(DeflateCompression::default()),
    }
}

pub struct NoCompression;
impl Compressor for NoCompression {
    fn compress(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }

    fn decompress(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct DeflateCompression {
    level: Compression,
}

impl Default for DeflateCompression {
    fn default() -> Self {
        DeflateCompression { level: Compression::default() }
    }
}

impl DeflateCompression {
    /// 0 (none) to 9 (best)
    pub fn with_level(level: u32) -> DeflateCompression {
        DeflateCompression { level: Compression::new(level.min(9)) }
    }
}

impl Compressor for DeflateCompression {
    fn compress(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(buf.len() / 2 + 16), self.level);
        encoder.write_all(buf)?;
        let compressed = encoder.finish()?;

        buf.clear();
        buf.extend_from_slice(&compressed);
        Ok(())
    }

    fn decompress(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut decompressed = Vec::with_capacity(buf.len() * 2);
        DeflateDecoder::new(&buf[..]).read_to_end(&mut decompressed)?;

        buf.clear();
        buf.extend_from_slice(&decompressed);
        Ok(())
    }
}
