//! ネットワーク設定
//!
//! サーバーがバインドする IP とポート範囲。JSON（serde）で読み書きできる。

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};

/// デフォルトのポート範囲の下端
pub const PORT_RANGE_LOW: u16 = 60001;
/// デフォルトのポート範囲の上端
pub const PORT_RANGE_HIGH: u16 = 60999;

/// バインドするポートの範囲（両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    /// `"port"` または `"low:high"` をパースする
    ///
    /// # エラー
    /// - `NetworkError::InvalidPortRange`: 数値でない、[0, 65535] の範囲外、`low > high`
    pub fn parse(desired: &str) -> Result<Self> {
        let desired = desired.trim();
        match desired.split_once(':') {
            Some((low, high)) => {
                let low = parse_port(low, "low")?;
                let high = parse_port(high, "high")?;
                if low > high {
                    return Err(NetworkError::InvalidPortRange(format!(
                        "low port {low} greater than high port {high}"
                    )));
                }
                Ok(PortRange { low, high })
            }
            None => {
                let port = parse_port(desired, "solo")?;
                Ok(PortRange { low: port, high: port })
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            low: PORT_RANGE_LOW,
            high: PORT_RANGE_HIGH,
        }
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}:{}", self.low, self.high)
        }
    }
}

fn parse_port(value: &str, hint: &str) -> Result<u16> {
    let parsed: i64 = value
        .parse()
        .map_err(|_| NetworkError::InvalidPortRange(format!("invalid ({hint}) port number {value:?}")))?;
    u16::try_from(parsed).map_err(|_| {
        NetworkError::InvalidPortRange(format!(
            "({hint}) port number {parsed} outside valid range [0..65535]"
        ))
    })
}

/// サーバー側 Connection の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// バインドする IP
    pub bind_ip: IpAddr,
    /// バインドを試みるポート範囲
    pub port_range: PortRange,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: PortRange::default(),
        }
    }
}
