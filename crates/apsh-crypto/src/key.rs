//! セッション鍵（128bit）と Base64 表現

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

use crate::error::CryptoError;

/// 鍵のバイト長
pub const KEY_LEN: usize = 16;

/// 128bit のセッション鍵
///
/// サーバーが乱数で生成し、Base64（22文字、パディングなし）でクライアントに渡す。
#[derive(Clone, PartialEq, Eq)]
pub struct Base64Key([u8; KEY_LEN]);

impl Base64Key {
    /// OS の乱数源から新しい鍵を生成する
    pub fn random() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        getrandom::getrandom(&mut key).map_err(|_| CryptoError::RandomFailed)?;
        Ok(Base64Key(key))
    }

    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Base64Key(key)
    }

    /// Base64 文字列を 16 バイトの鍵にデコードする
    ///
    /// 末尾の `=` パディングは有無どちらも受け付ける。
    pub fn from_printable(printable: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD_NO_PAD
            .decode(printable.trim().trim_end_matches('='))
            .map_err(|_| CryptoError::InvalidBase64)?;

        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Base64Key(key))
    }

    /// 22 文字の Base64 表現
    pub fn printable(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }

    pub fn data(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// 鍵そのものはログに出さない
impl core::fmt::Debug for Base64Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Base64Key(..)")
    }
}
