//! Instruction バイト列の圧縮 / 展開（zlib）
//!
//! Fragmenter はエンコード済み Instruction を圧縮してから分割し、
//! FragmentAssembly は結合後に展開してからデコードする。

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{NetworkError, Result};

/// 展開後サイズの上限
pub const MAX_DECOMPRESSED_LEN: usize = 1024 * 1024;

/// zlib 圧縮器（状態を持たない）
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: Compression,
}

impl Compressor {
    pub fn new() -> Self {
        Compressor {
            level: Compression::default(),
        }
    }

    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder.write_all(input).map_err(NetworkError::Compress)?;
        encoder.finish().map_err(NetworkError::Compress)
    }

    /// 展開する
    ///
    /// # エラー
    /// - `NetworkError::Decompress`: zlib ストリームとして不正
    /// - `NetworkError::Oversize`: 展開後が `MAX_DECOMPRESSED_LEN` を超える
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let decoder = ZlibDecoder::new(input);

        // 上限 + 1 バイトまで読めば超過を検出できる
        let mut output = Vec::new();
        decoder
            .take(MAX_DECOMPRESSED_LEN as u64 + 1)
            .read_to_end(&mut output)
            .map_err(NetworkError::Decompress)?;

        if output.len() > MAX_DECOMPRESSED_LEN {
            return Err(NetworkError::Oversize(MAX_DECOMPRESSED_LEN));
        }
        Ok(output)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let compressor = Compressor::new();
        let input: Vec<u8> = b"hello hello hello hello".repeat(20);

        let compressed = compressor.compress(&input).unwrap();
        assert!(compressed.len() < input.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_empty_input() {
        let compressor = Compressor::new();
        let compressed = compressor.compress(&[]).unwrap();
        assert!(compressor.decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_zlib_stream_header() {
        // 相手の実装と同じ zlib 形式（CMF = 0x78）
        let compressed = Compressor::new().compress(b"apsh").unwrap();
        assert_eq!(compressed[0], 0x78);
        assert_eq!((u16::from(compressed[0]) << 8 | u16::from(compressed[1])) % 31, 0);
    }

    #[test]
    fn test_decompress_foreign_zlib() {
        // 標準的な zlib で "hello" を圧縮したバイト列
        let stream = [
            0x78, 0x9c, 0xcb, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00, 0x06, 0x2c, 0x02, 0x15,
        ];
        assert_eq!(Compressor::new().decompress(&stream).unwrap(), b"hello");
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = Compressor::new().decompress(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert!(matches!(result, Err(NetworkError::Decompress(_))));
    }

    #[test]
    fn test_oversize_is_rejected() {
        let compressor = Compressor::new();
        let big = vec![0u8; MAX_DECOMPRESSED_LEN + 1];
        let compressed = compressor.compress(&big).unwrap();

        assert!(matches!(
            compressor.decompress(&compressed),
            Err(NetworkError::Oversize(MAX_DECOMPRESSED_LEN))
        ));
    }
}
