//! # apsh-stream
//!
//! クライアント → サーバー方向に同期する「ユーザー入力」の状態。
//!
//! ## 設計の背景
//!
//! SSP は状態を同期するので、キー入力もストリームではなくイベントの列として扱う。
//! 相手が確認済みの先頭部分は `subtract` で取り除かれ、diff は未確認の末尾だけになる。
//!
//! ## diff の形式
//!
//! ```protobuf
//! message UserMessage { repeated Instruction instruction = 1; }
//! message Instruction {
//!   optional Keystroke keystroke = 2;
//!   optional ResizeMessage resize = 3;
//! }
//! message Keystroke { optional bytes keys = 4; }
//! message ResizeMessage { optional int32 width = 5; optional int32 height = 6; }
//! ```
//!
//! 連続したキー入力は 1 つの `Keystroke` にまとめて送る。

pub mod message;
pub mod user;

pub use message::UserMessage;
pub use user::{UserEvent, UserStream};
