//! # apsh-network
//!
//! UDP ネットワーク層の実装。
//!
//! 暗号化されたローミング対応の `Connection` と、Instruction を MTU に収まる
//! Fragment に分割/再組み立てする仕組みを担当する。
//!
//! ## Fragment の Wire Format
//!
//! ```text
//! [instruction_id: u64 BE][fragment_num_with_final: u16 BE][contents...]
//!
//! fragment_num_with_final:
//!   bit 15 (MSB) = is_final フラグ（最後の Fragment なら 1）
//!   bit 0..14    = fragment_num（0 始まり）
//! ```
//!
//! ## UDP ペイロードの全体構造
//!
//! ```text
//! [nonce_tail: 8bytes][encrypted(timestamp: u16 | timestamp_reply: u16 | fragment) + auth_tag: 16bytes]
//! ```
//!
//! ソケットオプション（IP_TOS / IP_RECVTOS）と `recvmsg` を使うため unix 専用。

pub mod compressor;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod packet;
pub mod rtt;
mod socket;
pub mod timestamp;

pub use compressor::Compressor;
pub use config::{NetworkConfig, PortRange};
pub use connection::{Connection, Link};
pub use error::NetworkError;
pub use fragment::{Fragment, FragmentAssembly, Fragmenter};
pub use packet::Packet;
pub use rtt::RttEstimator;
pub use timestamp::Timestamp16;
