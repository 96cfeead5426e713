//! ユーザー入力の状態

use std::fmt;

use apsh_ssp::{State, StateError};
use tracing::trace;

use crate::message::{Keystroke, ResizeMessage, UserInstruction, UserMessage};

/// ユーザー入力イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    /// キー入力 1 バイト
    Keystroke(u8),
    /// 端末サイズの変更
    Resize { cols: u16, rows: u16 },
}

/// ユーザー入力イベントの列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStream {
    actions: Vec<UserEvent>,
}

impl UserStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// キー入力を 1 バイトずつイベントとして積む
    pub fn push_keystrokes(&mut self, keys: &[u8]) {
        self.actions.extend(keys.iter().map(|&b| UserEvent::Keystroke(b)));
    }

    pub fn push_resize(&mut self, cols: u16, rows: u16) {
        self.actions.push(UserEvent::Resize { cols, rows });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&UserEvent> {
        self.actions.get(idx)
    }

    pub fn actions(&self) -> &[UserEvent] {
        &self.actions
    }

    /// 保持しているキー入力だけを連結したもの
    pub fn keystrokes(&self) -> Vec<u8> {
        self.actions
            .iter()
            .filter_map(|ev| match ev {
                UserEvent::Keystroke(b) => Some(*b),
                UserEvent::Resize { .. } => None,
            })
            .collect()
    }

    /// `other` と先頭から一致するイベントの数
    fn common_prefix_len(&self, other: &UserStream) -> usize {
        self.actions
            .iter()
            .zip(other.actions.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl State for UserStream {
    fn subtract(&mut self, prefix: &Self) {
        if self == prefix {
            self.actions.clear();
            return;
        }
        let n = self.common_prefix_len(prefix);
        self.actions.drain(..n);
    }

    fn diff_from(&self, existing: &Self) -> Vec<u8> {
        let pos = self.common_prefix_len(existing);
        if pos == self.actions.len() {
            return Vec::new();
        }

        let mut msg = UserMessage::default();
        for ev in &self.actions[pos..] {
            match *ev {
                UserEvent::Keystroke(b) => {
                    // 直前も Keystroke ならそこに追記する
                    if let Some(Keystroke { keys: Some(keys) }) =
                        msg.instruction.last_mut().and_then(|inst| inst.keystroke.as_mut())
                    {
                        keys.push(b);
                        continue;
                    }
                    msg.instruction.push(UserInstruction {
                        keystroke: Some(Keystroke { keys: Some(vec![b]) }),
                        resize: None,
                    });
                }
                UserEvent::Resize { cols, rows } => {
                    msg.instruction.push(UserInstruction {
                        keystroke: None,
                        resize: Some(ResizeMessage {
                            width: Some(i32::from(cols)),
                            height: Some(i32::from(rows)),
                        }),
                    });
                }
            }
        }

        msg.encode_to_bytes()
    }

    fn init_diff(&self) -> Vec<u8> {
        self.diff_from(&UserStream::default())
    }

    fn apply_string(&mut self, diff: &[u8]) -> Result<(), StateError> {
        let msg = UserMessage::decode_from_bytes(diff).map_err(|e| StateError::CorruptDiff(e.to_string()))?;

        // 全部検証してから追記する（途中で失敗しても状態は変えない）
        let mut events = Vec::new();
        for inst in msg.instruction {
            if let Some(ks) = inst.keystroke {
                events.extend(ks.keys.unwrap_or_default().into_iter().map(UserEvent::Keystroke));
            } else if let Some(rs) = inst.resize {
                let cols = dimension(rs.width)?;
                let rows = dimension(rs.height)?;
                events.push(UserEvent::Resize { cols, rows });
            }
        }

        trace!(events = events.len(), "applying user input");
        self.actions.extend(events);
        Ok(())
    }

    fn reset(&mut self) {
        self.actions.clear();
    }

    fn init_size(&mut self, cols: u16, rows: u16) {
        self.push_resize(cols, rows);
    }
}

fn dimension(value: Option<i32>) -> Result<u16, StateError> {
    let value = value.unwrap_or(0);
    u16::try_from(value).map_err(|_| StateError::CorruptDiff(format!("invalid window dimension {value}")))
}

impl fmt::Display for UserStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = String::from_utf8_lossy(&self.keystrokes()).into_owned();
        write!(f, "Keystroke:{keys:?}, Resize:")?;
        for ev in &self.actions {
            if let UserEvent::Resize { cols, rows } = ev {
                write!(f, "({cols},{rows}),")?;
            }
        }
        write!(f, " size={}", self.actions.len())
    }
}
