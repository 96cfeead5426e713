//! apsh-network エラー型

use std::io;

use apsh_crypto::CryptoError;
use apsh_proto::ProtoError;
use thiserror::Error;

/// ネットワーク層のエラー
#[derive(Debug, Error)]
pub enum NetworkError {
    /// ソケット I/O エラー
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 指定範囲のどのポートにもバインドできなかった
    #[error("Failed to bind {ip} on any port in {low}..={high}")]
    BindFailed { ip: String, low: u16, high: u16 },

    /// クライアントの接続先へ dial できなかった
    #[error("Failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// ポート指定文字列が不正
    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    /// 送信バイト数が暗号化後の長さと一致しない（MTU 超過とみなす）
    #[error("Short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    /// 復号後のテキストがタイムスタンプ分に満たない
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    /// Fragment ヘッダーに満たない
    #[error("Fragment too short: {0} bytes")]
    FragmentTooShort(usize),

    /// Instruction が 15 ビットの fragment 番号に収まらない
    #[error("Instruction needs {0} fragments, more than the wire format allows")]
    TooManyFragments(usize),

    /// 圧縮失敗
    #[error("Compression failed: {0}")]
    Compress(#[source] io::Error),

    /// 展開失敗
    #[error("Decompression failed: {0}")]
    Decompress(#[source] io::Error),

    /// 展開後のサイズが上限を超える
    #[error("Decompressed content exceeds {0} bytes")]
    Oversize(usize),

    /// 暗号エラー
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Instruction のデコードエラー
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
