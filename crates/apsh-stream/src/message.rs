//! UserMessage の prost 定義

use prost::Message as _;

/// diff 1 つ分のメッセージ
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserMessage {
    #[prost(message, repeated, tag = "1")]
    pub instruction: Vec<UserInstruction>,
}

/// キー入力かリサイズのどちらか一方を持つ
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserInstruction {
    #[prost(message, optional, tag = "2")]
    pub keystroke: Option<Keystroke>,
    #[prost(message, optional, tag = "3")]
    pub resize: Option<ResizeMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Keystroke {
    #[prost(bytes = "vec", optional, tag = "4")]
    pub keys: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResizeMessage {
    #[prost(int32, optional, tag = "5")]
    pub width: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub height: Option<i32>,
}

impl UserMessage {
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        UserMessage::decode(bytes)
    }
}
