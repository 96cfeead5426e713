//! Fragment 分割と再組み立て
//!
//! ## Fragment Wire Format
//! ```text
//! [instruction_id: u64 BE (8 bytes)]
//! [fragment_num_with_final: u16 BE (2 bytes)]
//!   - bit 15: is_final (最後の Fragment の場合 1)
//!   - bit 0..14: fragment 番号 (0 始まり)
//! [contents: variable]
//! ```
//!
//! 送信側は Instruction をエンコード → 圧縮してから MTU に収まるよう分割し、
//! 受信側は全 Fragment が揃った時点で結合 → 展開 → デコードする。

use std::collections::BTreeMap;

use apsh_proto::Instruction;
use tracing::{debug, trace};

use crate::compressor::Compressor;
use crate::error::{NetworkError, Result};

/// ネットワーク上の最小送受信単位
///
/// 一つの Instruction が MTU を超える場合、複数の Fragment に分割される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// この Fragment が属する Instruction の ID
    pub id: u64,
    /// Fragment 番号（0 始まり、15 ビット）
    pub fragment_num: u16,
    /// 最後の Fragment かどうか
    pub is_final: bool,
    /// 圧縮済み Instruction バイト列の一部
    pub contents: Vec<u8>,
}

impl Fragment {
    /// Fragment ヘッダー長（id: 8 + fragment_num_with_final: 2）
    pub const HEADER_LEN: usize = 10;

    /// 1 つの Instruction を分割できる Fragment 数の上限（番号は 15 ビット）
    pub const MAX_FRAGMENTS: usize = 0x8000;

    const FINAL_BIT: u16 = 0x8000;

    pub fn new(id: u64, fragment_num: u16, is_final: bool, contents: Vec<u8>) -> Self {
        Fragment {
            id,
            fragment_num: fragment_num & !Self::FINAL_BIT,
            is_final,
            contents,
        }
    }

    /// バイト列から Fragment を復元する（復号後のペイロードを渡す）
    ///
    /// # エラー
    /// - `NetworkError::FragmentTooShort`: ヘッダー（10 バイト）に満たない
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(NetworkError::FragmentTooShort(bytes.len()));
        }

        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&bytes[0..8]);
        let frag_word = u16::from_be_bytes([bytes[8], bytes[9]]);

        Ok(Fragment {
            id: u64::from_be_bytes(id_bytes),
            fragment_num: frag_word & !Self::FINAL_BIT,
            is_final: frag_word & Self::FINAL_BIT != 0,
            contents: bytes[Self::HEADER_LEN..].to_vec(),
        })
    }

    /// Fragment を Wire Format に変換する
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_LEN + self.contents.len());
        bytes.extend_from_slice(&self.id.to_be_bytes());

        let frag_word = self.fragment_num | if self.is_final { Self::FINAL_BIT } else { 0 };
        bytes.extend_from_slice(&frag_word.to_be_bytes());

        bytes.extend_from_slice(&self.contents);
        bytes
    }
}

/// Fragment を受け取り、Instruction に再組み立てする
///
/// 異なる id の Fragment が来たら、それまでの Fragment はすべて破棄する。
/// 同じ番号の重複は無視する。
#[derive(Debug, Default)]
pub struct FragmentAssembly {
    /// 現在組み立て中の instruction id
    current_id: Option<u64>,
    /// 受信済み Fragment（fragment_num → contents）
    arrived: BTreeMap<u16, Vec<u8>>,
    /// final Fragment を受け取った時点で判明する総数
    total: Option<usize>,
    compressor: Compressor,
}

impl FragmentAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragment を追加する
    ///
    /// # 戻り値
    /// Instruction のすべての Fragment が揃ったら `true`。
    /// その場合、呼び出し側は続けて `get_assembly()` を呼ぶ。
    pub fn add_fragment(&mut self, frag: Fragment) -> bool {
        if self.current_id != Some(frag.id) {
            self.arrived.clear();
            self.total = None;
            self.current_id = Some(frag.id);
        }

        if frag.is_final {
            self.total = Some(frag.fragment_num as usize + 1);
        }

        if self.arrived.contains_key(&frag.fragment_num) {
            trace!(id = frag.id, num = frag.fragment_num, "duplicate fragment ignored");
        } else {
            self.arrived.insert(frag.fragment_num, frag.contents);
        }

        self.is_complete()
    }

    /// 揃った Fragment を結合して Instruction を取り出す
    ///
    /// 展開またはデコードに失敗した場合は `None`（壊れたデータグラムとして捨てる）。
    /// どちらの場合も組み立て状態は空に戻る。
    pub fn get_assembly(&mut self) -> Option<Instruction> {
        if !self.is_complete() {
            return None;
        }

        let encoded: Vec<u8> = std::mem::take(&mut self.arrived).into_values().flatten().collect();
        self.total = None;

        let decompressed = match self.compressor.decompress(&encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "dropping instruction: decompression failed");
                return None;
            }
        };

        match Instruction::decode_from_bytes(&decompressed) {
            Ok(inst) => Some(inst),
            Err(e) => {
                debug!(error = %e, "dropping instruction: decode failed");
                None
            }
        }
    }

    /// 現在組み立て中の instruction id
    pub fn current_id(&self) -> Option<u64> {
        self.current_id
    }

    /// 保持している Fragment の数
    pub fn len(&self) -> usize {
        self.arrived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrived.is_empty()
    }

    fn is_complete(&self) -> bool {
        match self.total {
            // BTreeMap のキーは一意かつ昇順なので、個数と最大番号が合えば 0..total が揃っている
            Some(total) => {
                self.arrived.len() == total
                    && self.arrived.keys().next_back().map(|&k| k as usize) == Some(total - 1)
            }
            None => false,
        }
    }
}

/// Instruction を Fragment 列に分割する
///
/// 直前と同じ Instruction を同じ MTU で送るとき（再送）は同じ id を使い、
/// Instruction か MTU が変わったときだけ新しい id を払い出す。
#[derive(Debug, Default)]
pub struct Fragmenter {
    next_instruction_id: u64,
    last_instruction: Option<Instruction>,
    last_mtu: Option<usize>,
    compressor: Compressor,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instruction を Fragment 列に分割する
    ///
    /// # 引数
    /// - `inst`: diff / ack / chaff 等を埋め終えた Instruction
    /// - `mtu`: Fragment 1 つ（ヘッダー込み）の最大バイト数
    ///
    /// # 戻り値
    /// 1 つ以上の Fragment。最後の 1 つだけ `is_final` が立つ。
    ///
    /// # エラー
    /// - `NetworkError::TooManyFragments`: 15 ビットの fragment 番号に収まらない
    pub fn make_fragments(&mut self, inst: &Instruction, mtu: usize) -> Result<Vec<Fragment>> {
        let payload = self.compressor.compress(&inst.encode_to_bytes())?;
        let chunk_len = mtu.saturating_sub(Fragment::HEADER_LEN).max(1);
        let num_chunks = payload.len().div_ceil(chunk_len).max(1);
        if num_chunks > Fragment::MAX_FRAGMENTS {
            return Err(NetworkError::TooManyFragments(num_chunks));
        }

        if self.last_instruction.as_ref() != Some(inst) || self.last_mtu != Some(mtu) {
            self.next_instruction_id = self.next_instruction_id.wrapping_add(1);
        }
        self.last_instruction = Some(inst.clone());
        self.last_mtu = Some(mtu);
        let id = self.next_instruction_id;

        if payload.is_empty() {
            return Ok(vec![Fragment::new(id, 0, true, Vec::new())]);
        }

        let mut fragments = Vec::with_capacity(num_chunks);
        for (num, chunk) in (0u16..).zip(payload.chunks(chunk_len)) {
            let is_final = usize::from(num) == num_chunks - 1;
            fragments.push(Fragment::new(id, num, is_final, chunk.to_vec()));
        }
        Ok(fragments)
    }

    /// 直前に分割した Instruction の ack_num
    pub fn last_ack_sent(&self) -> u64 {
        self.last_instruction.as_ref().map_or(0, |inst| inst.ack_num)
    }

    /// 直前に払い出した instruction id
    pub fn current_id(&self) -> u64 {
        self.next_instruction_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_instruction(diff_len: usize) -> Instruction {
        // 圧縮が効かないよう xorshift の擬似乱数で埋める
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        let diff: Vec<u8> = (0..diff_len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect();
        Instruction::new(1, 2, 3, 1, diff, vec![0x5A; 4])
    }

    proptest! {
        #[test]
        fn fragment_wire_roundtrip(
            id in any::<u64>(),
            fragment_num in 0u16..0x8000,
            is_final in any::<bool>(),
            contents in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let frag = Fragment::new(id, fragment_num, is_final, contents);
            let restored = Fragment::from_bytes(&frag.to_bytes()).unwrap();
            prop_assert_eq!(restored, frag);
        }
    }

    #[test]
    fn test_final_bit_encoding() {
        let bytes = Fragment::new(1, 3, true, vec![]).to_bytes();
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 0x8003);

        let bytes = Fragment::new(1, 3, false, vec![]).to_bytes();
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 0x0003);
    }

    #[test]
    fn test_fragment_count_is_bounded() {
        let inst = sample_instruction(40_000);
        let mut fragmenter = Fragmenter::new();

        // ヘッダー + 1 バイトずつでは 15 ビットの番号が足りない
        let err = fragmenter.make_fragments(&inst, Fragment::HEADER_LEN + 1).unwrap_err();
        assert!(matches!(err, NetworkError::TooManyFragments(n) if n > Fragment::MAX_FRAGMENTS));
        assert_eq!(fragmenter.current_id(), 0, "失敗した分割は id を消費しない");

        let frags = fragmenter.make_fragments(&inst, Fragment::HEADER_LEN + 2).unwrap();
        assert!(frags.len() <= Fragment::MAX_FRAGMENTS);
        assert_eq!(frags.last().map(|f| f.fragment_num), Some(frags.len() as u16 - 1));
        assert!(frags.last().is_some_and(|f| f.is_final));
    }

    #[test]
    fn test_too_short_is_malformed() {
        assert!(matches!(
            Fragment::from_bytes(&[0u8; 9]),
            Err(NetworkError::FragmentTooShort(9))
        ));
    }

    #[test]
    fn test_roundtrip_through_fragmenter_and_assembly() {
        let inst = sample_instruction(3000);
        let frags = Fragmenter::new().make_fragments(&inst, 500).unwrap();
        assert!(frags.len() > 1, "3000 バイトの diff は複数 Fragment になる");
        assert!(frags.iter().all(|f| f.to_bytes().len() <= 500));
        assert!(frags.last().unwrap().is_final);
        assert_eq!(frags.iter().filter(|f| f.is_final).count(), 1);

        let mut assembly = FragmentAssembly::new();
        let mut completed = 0;
        for frag in frags {
            if assembly.add_fragment(frag) {
                completed += 1;
                assert_eq!(assembly.get_assembly(), Some(inst.clone()));
            }
        }
        assert_eq!(completed, 1);
        assert!(assembly.is_empty());
    }

    #[test]
    fn test_scrambled_and_duplicated_delivery() {
        let inst = sample_instruction(1500);
        let frags = Fragmenter::new().make_fragments(&inst, 500).unwrap();
        assert_eq!(frags.len(), 4, "1500 バイトは 490 バイトずつ 4 分割される");

        let mut assembly = FragmentAssembly::new();
        let order = [2usize, 0, 2, 1, 1, 3];
        for (i, &idx) in order.iter().enumerate() {
            let done = assembly.add_fragment(frags[idx].clone());
            assert_eq!(done, i == order.len() - 1, "最後の 1 つで初めて揃う");
        }
        assert_eq!(assembly.get_assembly(), Some(inst));
    }

    #[test]
    fn test_final_first_does_not_complete_early() {
        let inst = sample_instruction(1500);
        let frags = Fragmenter::new().make_fragments(&inst, 500).unwrap();

        let mut assembly = FragmentAssembly::new();
        assert!(!assembly.add_fragment(frags[3].clone()));
        assert!(!assembly.add_fragment(frags[0].clone()));
        assert!(!assembly.add_fragment(frags[1].clone()));
        assert_eq!(assembly.get_assembly(), None, "未完成なら取り出せない");
        assert!(assembly.add_fragment(frags[2].clone()));
    }

    #[test]
    fn test_new_id_discards_old_fragments() {
        let mut assembly = FragmentAssembly::new();
        assert!(!assembly.add_fragment(Fragment::new(1, 0, false, vec![1, 2, 3])));

        let inst = sample_instruction(10);
        let frags = {
            let mut fragmenter = Fragmenter::new();
            fragmenter.make_fragments(&sample_instruction(5), 500).unwrap();
            fragmenter.make_fragments(&inst, 500).unwrap()
        };
        assert_eq!(frags[0].id, 2);
        assert!(assembly.add_fragment(frags[0].clone()));
        assert_eq!(assembly.current_id(), Some(2));
        assert_eq!(assembly.get_assembly(), Some(inst));
    }

    #[test]
    fn test_fragmenter_id_tracks_instruction_and_mtu() {
        let mut fragmenter = Fragmenter::new();
        let inst = sample_instruction(100);

        let first = fragmenter.make_fragments(&inst, 500).unwrap()[0].id;
        let resend = fragmenter.make_fragments(&inst, 500).unwrap()[0].id;
        assert_eq!(first, resend, "同じ Instruction の再送は同じ id");

        let resized = fragmenter.make_fragments(&inst, 400).unwrap()[0].id;
        assert_ne!(resized, resend, "MTU が変わったら新しい id");

        let changed = fragmenter.make_fragments(&sample_instruction(101), 400).unwrap()[0].id;
        assert_ne!(changed, resized, "内容が変わったら新しい id");
        assert_eq!(fragmenter.last_ack_sent(), 3);
    }

    #[test]
    fn test_garbled_assembly_yields_none() {
        let mut assembly = FragmentAssembly::new();
        assert!(assembly.add_fragment(Fragment::new(9, 0, true, vec![0xDE, 0xAD, 0xBE, 0xEF])));
        assert_eq!(assembly.get_assembly(), None);
        assert!(assembly.is_empty());
    }
}
