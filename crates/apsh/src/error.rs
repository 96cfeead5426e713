//! apsh エラー型

use apsh_crypto::CryptoError;
use apsh_network::NetworkError;
use apsh_ssp::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApshError {
    /// 設定ファイルが読めない
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// 設定の JSON が不正
    #[error("Invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ApshError>;
