//! 暗号エラー型

use thiserror::Error;

/// 暗号操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 鍵の長さが不正（16バイト以外）
    #[error("Invalid key length (expected 16 bytes, got {0})")]
    InvalidKeyLength(usize),
    /// Base64 デコードに失敗
    #[error("Invalid Base64 encoding")]
    InvalidBase64,
    /// 乱数生成に失敗
    #[error("Random number generator failed")]
    RandomFailed,
    /// 暗号化に失敗
    #[error("Encryption failed")]
    EncryptionFailed,
    /// 復号に失敗（認証タグ検証失敗を含む）
    #[error("Decryption failed (authentication tag mismatch)")]
    DecryptionFailed,
    /// パケットが短すぎる
    #[error("Packet too short ({0} bytes)")]
    PacketTooShort(usize),
}
