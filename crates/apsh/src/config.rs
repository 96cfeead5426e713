//! セッション設定（JSON）

use std::path::Path;

use apsh_network::NetworkConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// セッション設定
///
/// すべての項目に既定値がある。`{}` も有効な設定。
///
/// ```json
/// {
///   "network": { "bind_ip": "0.0.0.0", "port_range": { "low": 60001, "high": 60999 } },
///   "send_mindelay_ms": 8,
///   "verbose": false,
///   "max_wait_ms": 250
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub network: NetworkConfig,
    /// 連続した変更をまとめる待ち時間（ms）
    pub send_mindelay_ms: u64,
    /// 送信 diff の往復検証とログ
    pub verbose: bool,
    /// 1 回のループで待つ時間の上限（ms）
    pub max_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            network: NetworkConfig::default(),
            send_mindelay_ms: apsh_ssp::SEND_MINDELAY,
            verbose: false,
            max_wait_ms: apsh_ssp::SEND_INTERVAL_MAX,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// JSON ファイルから読み込む
    ///
    /// # エラー
    /// - `ApshError::Io`: ファイルが読めない
    /// - `ApshError::Config`: JSON が不正
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
