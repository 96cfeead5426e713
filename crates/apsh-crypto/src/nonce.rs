//! Nonce と暗号化前後のメッセージ
//!
//! ## Nonce 構造（12バイト）
//! ```text
//! bytes[0..4]  = 0x00000000  (ゼロパディング)
//! bytes[4..12] = direction_seq as u64, big-endian
//! ```
//!
//! UDP ペイロードには nonce の後半 8 バイト（bytes[4..12]）のみ送信する
//! （先頭 4 バイトは常にゼロなので省略）

/// Nonce のバイト長
pub const NONCE_LEN: usize = 12;

/// UDP ペイロードに載る nonce の後半部分のバイト長
pub const NONCE_TAIL_LEN: usize = 8;

/// 12 バイトの Nonce
///
/// direction ビット込みのシーケンス番号から構築され、AES-128-OCB3 の nonce として使用される。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// シーケンス番号から Nonce を構築する
    ///
    /// # 例
    /// ```
    /// use apsh_crypto::Nonce;
    /// let nonce = Nonce::new(42);
    /// assert_eq!(nonce.val(), 42);
    /// ```
    pub fn new(direction_seq: u64) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[4..12].copy_from_slice(&direction_seq.to_be_bytes());
        Nonce(bytes)
    }

    /// 受信パケットの先頭 8 バイトから Nonce を復元する
    pub fn from_tail(bytes: &[u8]) -> Option<Self> {
        let tail: [u8; NONCE_TAIL_LEN] = bytes.get(..NONCE_TAIL_LEN)?.try_into().ok()?;
        let mut full = [0u8; NONCE_LEN];
        full[4..12].copy_from_slice(&tail);
        Some(Nonce(full))
    }

    /// direction ビット込みのシーケンス番号
    pub fn val(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(buf)
    }

    /// 12 バイトの nonce データ
    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// UDP ペイロードに埋め込む 8 バイト（nonce の後半）
    pub fn tail_bytes(&self) -> &[u8] {
        &self.0[4..12]
    }
}

/// 暗号化前（または復号後）のメッセージ
///
/// `text` の中身（タイムスタンプ + ペイロード）の解釈はネットワーク層が行う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub nonce: Nonce,
    pub text: Vec<u8>,
}

impl Message {
    pub fn new(direction_seq: u64, text: Vec<u8>) -> Self {
        Message {
            nonce: Nonce::new(direction_seq),
            text,
        }
    }
}
