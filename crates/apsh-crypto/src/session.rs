//! AES-128-OCB3 セッション実装
//!
//! ## UDP ペイロード構造
//! ```text
//! [nonce_tail: 8bytes][ciphertext + auth_tag(16): variable]
//! ```

use aead::{Aead, KeyInit};
use aes::Aes128;
use ocb3::Ocb3;

use crate::error::CryptoError;
use crate::key::Base64Key;
use crate::nonce::{Message, Nonce, NONCE_TAIL_LEN};

/// AES-128-OCB3 (12バイト nonce, 16バイト tag) の型エイリアス
type Aes128Ocb3 = Ocb3<Aes128>;

/// AES-128-OCB3 暗号セッション
///
/// シーケンス番号の採番は行わない。nonce は呼び出し側が `Message` に入れて渡す
/// （`SeqCounter` を参照）。
pub struct CryptoSession {
    cipher: Aes128Ocb3,
}

impl CryptoSession {
    /// 暗号化で増えるバイト数（認証タグ）
    pub const ADDED_BYTES: usize = 16;

    /// 16 バイトの鍵からセッションを初期化する
    pub fn new(key: &Base64Key) -> Self {
        CryptoSession {
            cipher: Aes128Ocb3::new(key.data().into()),
        }
    }

    /// メッセージを暗号化して UDP ペイロードを返す
    ///
    /// # 戻り値
    /// `[nonce_tail: 8bytes][ciphertext_with_tag]`
    pub fn encrypt(&self, message: &Message) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = self
            .cipher
            .encrypt(message.nonce.as_bytes().into(), message.text.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut packet = Vec::with_capacity(NONCE_TAIL_LEN + ciphertext.len());
        packet.extend_from_slice(message.nonce.tail_bytes());
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// 受信した UDP ペイロードを復号する
    ///
    /// # エラー
    /// - `CryptoError::PacketTooShort`: nonce_tail(8) + tag(16) に満たない
    /// - `CryptoError::DecryptionFailed`: 認証タグ検証失敗
    pub fn decrypt(&self, packet: &[u8]) -> Result<Message, CryptoError> {
        if packet.len() < NONCE_TAIL_LEN + Self::ADDED_BYTES {
            return Err(CryptoError::PacketTooShort(packet.len()));
        }

        let nonce = Nonce::from_tail(packet).ok_or(CryptoError::PacketTooShort(packet.len()))?;
        let text = self
            .cipher
            .decrypt(nonce.as_bytes().into(), &packet[NONCE_TAIL_LEN..])
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(Message { nonce, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session() -> CryptoSession {
        CryptoSession::new(&Base64Key::from_bytes([0u8; 16]))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let session = make_session();
        let message = Message::new(1 << 63 | 7, b"Hello, apsh!".to_vec());

        let packet = session.encrypt(&message).unwrap();
        assert_eq!(packet.len(), 8 + 12 + CryptoSession::ADDED_BYTES);

        // 同じ鍵の別セッションで復号する
        let decrypted = make_session().decrypt(&packet).unwrap();
        assert_eq!(decrypted, message);
        assert_eq!(decrypted.nonce.val(), 1 << 63 | 7);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let packet = make_session()
            .encrypt(&Message::new(1, b"secret".to_vec()))
            .unwrap();

        let other = CryptoSession::new(&Base64Key::from_bytes([0xFF; 16]));
        assert_eq!(other.decrypt(&packet), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_decrypt_tampered_fails() {
        let session = make_session();
        let mut packet = session.encrypt(&Message::new(3, b"authentic".to_vec())).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert_eq!(session.decrypt(&packet), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_decrypt_too_short_fails() {
        let session = make_session();
        assert_eq!(session.decrypt(&[0u8; 10]), Err(CryptoError::PacketTooShort(10)));
    }
}
