//! # apsh
//!
//! ローミング対応・暗号化 UDP 上の状態同期セッション。
//!
//! ## 使用方法
//!
//! ```no_run
//! use apsh::{Session, SessionConfig, UserStream};
//!
//! # fn main() -> Result<(), apsh::ApshError> {
//! let config = SessionConfig::from_json_str(r#"{ "max_wait_ms": 50 }"#)?;
//!
//! // サーバー: 鍵とポートをクライアントに伝える
//! let mut server: Session<UserStream, UserStream> =
//!     Session::server(config.clone(), UserStream::new(), UserStream::new())?;
//! println!("APSH CONNECT {} {}", server.port().unwrap_or(0), server.key());
//!
//! loop {
//!     server.run_once()?;
//!     let input = server.get_remote_diff();
//!     if !input.is_empty() {
//!         // 端末へ渡す
//!     }
//!     if server.transport().counterparty_shutdown_ack_sent() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## クレート構成
//!
//! ```text
//! apsh
//!   ├── apsh-stream  (UserStream: キー入力とリサイズ)
//!   └── apsh-ssp     (Transport / TransportSender: 状態同期)
//!         └── apsh-network (Connection: UDP・ローミング・Fragment・圧縮)
//!               ├── apsh-proto  (Instruction)
//!               └── apsh-crypto (AES-128-OCB3)
//! ```

pub mod config;
pub mod error;
pub mod session;

pub use config::SessionConfig;
pub use error::ApshError;
pub use session::Session;

pub use apsh_crypto::{Base64Key, SeqCounter};
pub use apsh_network::{Connection, Link, NetworkConfig, PortRange};
pub use apsh_proto::PROTOCOL_VERSION;
pub use apsh_ssp::{State, StateError, TimestampedState, Transport, TransportError, TransportStats, SHUTDOWN_NUM};
pub use apsh_stream::{UserEvent, UserStream};
