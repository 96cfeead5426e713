//! 暗号化されたローミング対応 UDP コネクション
//!
//! ## 役割
//! - 送信: Packet を組み立てて暗号化し、最新のソケットから送る
//! - 受信: 開いているソケットを順に読み、復号・方向チェック・リプレイ対策を行う
//! - RTT 推定（タイムスタンプのエコーから）と ECN 観測
//! - クライアントのポートホッピング（NAT の張り替えに追従）
//! - サーバーのローミング追従（クライアントの送信元アドレスが変わったら付け替える）
//!
//! ## リプレイ対策
//! `expected_receiver_seq` 未満のシーケンス番号のパケットは呼び出し側には返すが、
//! タイムスタンプ・RTT・送信先アドレスの更新には使わない。

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use apsh_crypto::{Base64Key, CryptoSession, Direction, SeqCounter, NONCE_TAIL_LEN};
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::packet::{Packet, TIMESTAMPS_LEN};
use crate::rtt::RttEstimator;
use crate::socket;
use crate::timestamp::{now_ms, Timestamp16};

/// 送信 MTU の初期値兼フォールバック値
pub const DEFAULT_SEND_MTU: usize = 500;
/// IPv4 の想定 MTU（モバイル回線のトンネルを考慮して小さめ）
pub const DEFAULT_IPV4_MTU: usize = 1280;
/// IPv6 の最小保証 MTU
pub const DEFAULT_IPV6_MTU: usize = 1280;
/// IPv4 ヘッダー + UDP ヘッダー
pub const IPV4_HEADER_LEN: usize = 20 + 8;
/// IPv6 ヘッダー + 最小の拡張ヘッダー 2 つ + UDP ヘッダー
pub const IPV6_HEADER_LEN: usize = 40 + 16 + 8;

/// 受信バッファのサイズ
pub const RECEIVE_MTU: usize = 2048;

/// これだけ相手から受信がなければサーバーは切り離す（ms）
pub const SERVER_ASSOCIATION_TIMEOUT: u64 = 40_000;
/// クライアントがポートを張り替える間隔（ms）
pub const PORT_HOP_INTERVAL: u64 = 10_000;
/// 同時に開いておくソケット数の上限
pub const MAX_PORTS_OPEN: usize = 10;
/// 新しいソケットがこれだけ使われたら古いソケットは閉じる（ms）
pub const MAX_OLD_SOCKET_AGE: u64 = 60_000;
/// ECN で輻輳を検出したときにエコーするタイムスタンプから引く値（ms）
pub const CONGESTION_TIMESTAMP_PENALTY: u16 = 500;

/// 保存したタイムスタンプをエコーに使える期間（ms）
const TIMESTAMP_REPLY_WINDOW: u64 = 1000;

/// 送信側の状態機械から見たコネクション
///
/// `Connection` が実装する。テストではメモリ上の実装に差し替える。
pub trait Link {
    /// ペイロード（Fragment のバイト列）を 1 データグラムとして送る
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// 最大 `timeout_ms` 待ってデータグラムを 1 つ受け取る
    ///
    /// タイムアウトや捨てたデータグラムは `Ok(None)`。
    fn recv(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>>;

    /// 再送タイムアウト（ms）
    fn timeout(&self) -> u64;

    /// 平滑化 RTT（ms）
    fn srtt(&self) -> f64;

    /// 送信できるデータグラムの最大長
    fn mtu(&self) -> usize;

    /// 送信先が分かっているか
    fn has_remote_addr(&self) -> bool;

    /// 相手からの ack で往復が確認できた送信時刻を伝える
    fn set_last_roundtrip_success(&mut self, timestamp_ms: u64);
}

pub struct Connection {
    /// 古い順。送信は常に最後のソケットから
    sockets: Vec<UdpSocket>,
    remote_addr: Option<SocketAddr>,
    has_remote_addr: bool,
    server: bool,
    mtu: usize,

    key: Base64Key,
    session: CryptoSession,
    seq: Arc<SeqCounter>,
    direction: Direction,

    /// 相手の最新タイムスタンプと、それを受け取った時刻
    saved_timestamp: Option<(Timestamp16, u64)>,
    expected_receiver_seq: u64,

    last_heard: u64,
    last_port_choice: u64,
    last_roundtrip_success: u64,

    rtt: RttEstimator,
    recv_buf: Vec<u8>,
    send_error: Option<String>,
}

impl Connection {
    /// 暗号化で Fragment に追加されるバイト数（nonce の後半 + タイムスタンプ 2 つ）
    pub const ADDED_BYTES: usize = NONCE_TAIL_LEN + TIMESTAMPS_LEN;

    /// サーバー側のコネクションを開く（鍵は乱数で生成）
    ///
    /// # エラー
    /// - `NetworkError::Crypto`: 乱数生成の失敗
    /// - `NetworkError::BindFailed`: 範囲内のどのポートにもバインドできない
    pub fn server(config: &NetworkConfig) -> Result<Self> {
        Self::server_with(config, Base64Key::random()?, Arc::new(SeqCounter::new()))
    }

    /// 鍵とシーケンスカウンタを指定してサーバー側のコネクションを開く
    pub fn server_with(config: &NetworkConfig, key: Base64Key, seq: Arc<SeqCounter>) -> Result<Self> {
        let range = config.port_range;
        let socket = (range.low..=range.high)
            .find_map(|port| socket::bind(SocketAddr::new(config.bind_ip, port)).ok())
            .ok_or_else(|| {
                warn!(ip = %config.bind_ip, %range, "no free port to bind");
                NetworkError::BindFailed {
                    ip: config.bind_ip.to_string(),
                    low: range.low,
                    high: range.high,
                }
            })?;

        let mut conn = Self::with_socket(socket, key, seq, true, now_ms());
        conn.mtu = mtu_for(config.bind_ip);
        debug!(local = ?conn.local_addr(), "server connection bound");
        Ok(conn)
    }

    /// クライアント側のコネクションを開く
    ///
    /// # 引数
    /// - `key`: サーバーから受け取った印字可能な鍵（Base64 22 文字）
    /// - `remote`: サーバーのアドレス
    pub fn client(key: &str, remote: SocketAddr) -> Result<Self> {
        Self::client_with(Base64Key::from_printable(key)?, remote, Arc::new(SeqCounter::new()))
    }

    /// 鍵とシーケンスカウンタを指定してクライアント側のコネクションを開く
    ///
    /// # エラー
    /// - `NetworkError::DialFailed`: ソケットの生成または connect の失敗
    pub fn client_with(key: Base64Key, remote: SocketAddr, seq: Arc<SeqCounter>) -> Result<Self> {
        let socket = socket::dial(remote).map_err(|source| NetworkError::DialFailed {
            addr: remote.to_string(),
            source,
        })?;

        let mut conn = Self::with_socket(socket, key, seq, false, now_ms());
        conn.remote_addr = Some(remote);
        conn.has_remote_addr = true;
        conn.mtu = mtu_for(remote.ip());
        Ok(conn)
    }

    fn with_socket(socket: UdpSocket, key: Base64Key, seq: Arc<SeqCounter>, server: bool, now: u64) -> Self {
        Connection {
            sockets: vec![socket],
            remote_addr: None,
            has_remote_addr: false,
            server,
            mtu: DEFAULT_SEND_MTU,
            session: CryptoSession::new(&key),
            key,
            seq,
            direction: if server { Direction::ToClient } else { Direction::ToServer },
            saved_timestamp: None,
            expected_receiver_seq: 0,
            last_heard: 0,
            last_port_choice: now,
            last_roundtrip_success: 0,
            rtt: RttEstimator::new(),
            recv_buf: vec![0u8; RECEIVE_MTU],
            send_error: None,
        }
    }

    /// 送信用パケットを組み立てる
    ///
    /// 1000 ms 以内に受け取った相手のタイムスタンプがあれば、保持していた時間だけ
    /// 進めてエコーする（1 度使ったら破棄）。
    fn new_packet(&mut self, payload: &[u8], now: u64) -> Packet {
        let reply = match self.saved_timestamp {
            Some((ts, received_at)) if now.saturating_sub(received_at) < TIMESTAMP_REPLY_WINDOW => {
                self.saved_timestamp = None;
                ts.advanced_by(now.saturating_sub(received_at))
            }
            _ => Timestamp16::NONE,
        };

        Packet::new(
            self.seq.next(),
            self.direction,
            Timestamp16::from_ms(now),
            reply,
            payload.to_vec(),
        )
    }

    /// ペイロードを暗号化して送る
    ///
    /// 送信先が未確定（サーバーがまだ受信していない、または切り離し済み）なら何もしない。
    ///
    /// # エラー
    /// - `NetworkError::ShortWrite`: 書き込めたバイト数が不足（MTU を既定値に下げる）
    /// - `NetworkError::Io`: ソケットエラー（EMSGSIZE なら MTU を既定値に下げる）
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let remote = match self.remote_addr {
            Some(addr) if self.has_remote_addr => addr,
            _ => return Ok(()),
        };

        let now = now_ms();
        let packet = self.new_packet(payload, now);
        let datagram = self.session.encrypt(&packet.to_message())?;

        let written = match self.sockets.last() {
            Some(sock) if self.server => sock.send_to(&datagram, remote),
            Some(sock) => sock.send(&datagram),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no open socket")),
        };

        let outcome = match written {
            Ok(sent) if sent == datagram.len() => {
                trace!(seq = packet.seq, len = sent, %remote, "sent datagram");
                self.send_error = None;
                Ok(())
            }
            Ok(sent) => {
                warn!(sent, expected = datagram.len(), "short write, falling back to default MTU");
                self.mtu = DEFAULT_SEND_MTU;
                Err(NetworkError::ShortWrite {
                    sent,
                    expected: datagram.len(),
                })
            }
            Err(e) => {
                if e.raw_os_error() == Some(libc::EMSGSIZE) {
                    warn!(len = datagram.len(), "datagram too large, falling back to default MTU");
                    self.mtu = DEFAULT_SEND_MTU;
                } else {
                    warn!(error = %e, %remote, "send failed");
                }
                Err(NetworkError::Io(e))
            }
        };
        if let Err(e) = &outcome {
            self.send_error = Some(e.to_string());
        }

        if self.server {
            if now.saturating_sub(self.last_heard) > SERVER_ASSOCIATION_TIMEOUT {
                self.has_remote_addr = false;
                info!(%remote, "server now detached from client");
            }
        } else if now.saturating_sub(self.last_port_choice) > PORT_HOP_INTERVAL
            && now.saturating_sub(self.last_roundtrip_success) > PORT_HOP_INTERVAL
        {
            self.hop_port(now);
        }

        outcome
    }

    /// 最大 `timeout_ms` 待ってデータグラムを 1 つ受け取る
    ///
    /// # 戻り値
    /// - `Ok(Some(payload))`: 復号済みペイロード（順序が古いパケットも含む）
    /// - `Ok(None)`: タイムアウト、または不正なデータグラムを捨てた
    ///
    /// ソケットごとの受信エラーはログに残して次のソケットを読む。
    ///
    /// # エラー
    /// - `NetworkError::Io`: 待機（poll）の失敗
    pub fn recv(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>> {
        if !socket::wait_readable(&self.sockets, timeout_ms)? {
            return Ok(None);
        }

        for idx in 0..self.sockets.len() {
            match self.recv_one(idx) {
                Ok(Some(payload)) => {
                    self.prune_sockets(now_ms());
                    return Ok(Some(payload));
                }
                Ok(None) => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                // 古いソケットに残った ICMP エラー（ECONNREFUSED など）で他を止めない
                Err(e) => {
                    debug!(error = %e, socket = idx, "receive error, trying next socket");
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn recv_one(&mut self, idx: usize) -> io::Result<Option<Vec<u8>>> {
        let datagram = socket::recv_with_ecn(&self.sockets[idx], &mut self.recv_buf)?;
        if datagram.truncated {
            debug!(len = datagram.len, "dropping oversize datagram");
            return Ok(None);
        }

        let message = match self.session.decrypt(&self.recv_buf[..datagram.len]) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, source = ?datagram.source, "dropping datagram");
                return Ok(None);
            }
        };
        let packet = match Packet::from_message(message) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "dropping datagram");
                return Ok(None);
            }
        };

        // 自分が送った方向のパケットが返ってきた（反射攻撃）
        let expected = if self.server { Direction::ToServer } else { Direction::ToClient };
        if packet.direction != expected {
            warn!(seq = packet.seq, source = ?datagram.source, "dropping datagram with wrong direction");
            return Ok(None);
        }

        if packet.seq >= self.expected_receiver_seq {
            self.observe_in_order(&packet, datagram.source, datagram.congestion_experienced, now_ms());
        } else {
            debug!(seq = packet.seq, expected = self.expected_receiver_seq, "out-of-order datagram");
        }

        Ok(Some(packet.payload))
    }

    /// 順序どおりのパケットでタイムスタンプ・RTT・送信先を更新する
    fn observe_in_order(&mut self, packet: &Packet, source: Option<SocketAddr>, congestion: bool, now: u64) {
        self.expected_receiver_seq = packet.seq + 1;

        if !packet.timestamp.is_none() {
            let mut ts = packet.timestamp;
            if congestion {
                // 相手に送信ペースを落とさせる
                ts = ts.retarded_by(CONGESTION_TIMESTAMP_PENALTY);
                if self.server {
                    debug!("received explicit congestion notification");
                }
            }
            self.saved_timestamp = Some((ts, now));
        }

        if !packet.timestamp_reply.is_none() {
            let sample = Timestamp16::diff(Timestamp16::from_ms(now), packet.timestamp_reply);
            if self.rtt.observe(sample as f64) {
                trace!(sample, srtt = self.rtt.srtt(), "rtt sample");
            }
        }

        self.has_remote_addr = true;
        self.last_heard = now;

        if self.server {
            if let Some(source) = source {
                if self.remote_addr != Some(source) {
                    self.remote_addr = Some(source);
                    self.mtu = mtu_for(source.ip());
                    info!(client = %source, "server now attached to client");
                }
            }
        }
    }

    /// 新しいソケットで相手に dial し直す（NAT の張り替え）
    fn hop_port(&mut self, now: u64) {
        let Some(remote) = self.remote_addr else {
            return;
        };
        self.last_port_choice = now;

        match socket::dial(remote) {
            Ok(sock) => {
                info!(local = ?sock.local_addr().ok(), %remote, "client hopped to a new port");
                self.sockets.push(sock);
            }
            Err(e) => {
                warn!(error = %e, %remote, "port hop failed");
                return;
            }
        }
        self.prune_sockets(now);
    }

    /// 古いソケットを閉じる
    ///
    /// 最新のソケットは常に残す。最新のソケットが十分長く使われていれば他はすべて閉じ、
    /// それでも上限を超えていれば古い順に閉じる。
    fn prune_sockets(&mut self, now: u64) {
        if self.sockets.len() <= 1 {
            return;
        }

        if now.saturating_sub(self.last_port_choice) > MAX_OLD_SOCKET_AGE {
            let stale = self.sockets.len() - 1;
            self.sockets.drain(..stale);
        }

        if self.sockets.len() > MAX_PORTS_OPEN {
            let excess = self.sockets.len() - MAX_PORTS_OPEN;
            self.sockets.drain(..excess);
        }
    }

    /// 印字可能なセッション鍵（クライアントに渡す）
    pub fn key(&self) -> String {
        self.key.printable()
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    /// 最新ソケットのローカルアドレス
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sockets.last().and_then(|s| s.local_addr().ok())
    }

    /// 最新ソケットのローカルポート
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// 最後の送信エラー（成功すると消える）
    pub fn send_error(&self) -> Option<&str> {
        self.send_error.as_deref()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }
}

impl Link for Connection {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        Connection::send(self, payload)
    }

    fn recv(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>> {
        Connection::recv(self, timeout_ms)
    }

    fn timeout(&self) -> u64 {
        self.rtt.timeout()
    }

    fn srtt(&self) -> f64 {
        self.rtt.srtt()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn has_remote_addr(&self) -> bool {
        self.has_remote_addr
    }

    fn set_last_roundtrip_success(&mut self, timestamp_ms: u64) {
        self.last_roundtrip_success = timestamp_ms;
    }
}

fn mtu_for(ip: IpAddr) -> usize {
    match ip {
        // IPv4-mapped IPv6 も v6 ソケット上を流れるので IPv6 扱い
        IpAddr::V6(_) => DEFAULT_IPV6_MTU - IPV6_HEADER_LEN,
        IpAddr::V4(_) => DEFAULT_IPV4_MTU - IPV4_HEADER_LEN,
    }
}
