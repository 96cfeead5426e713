//! apsh-proto エラー型

use thiserror::Error;

/// Protobuf エンコード/デコードのエラー
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗
    #[error("Proto decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
}
