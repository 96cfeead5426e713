//! apsh 統合テスト
//!
//! 127.0.0.1 上で実際の UDP ソケットを使い、
//! crypto + network + SSP + stream の完全なパイプラインを通す。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use apsh::{Base64Key, NetworkConfig, PortRange, Session, SessionConfig, State, UserEvent, UserStream, SHUTDOWN_NUM};

// ==============================================================
// ヘルパー
// ==============================================================

type UserSession = Session<UserStream, UserStream>;

fn loopback_config() -> SessionConfig {
    SessionConfig {
        network: NetworkConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            // 0 は OS に空きポートを選ばせる
            port_range: PortRange { low: 0, high: 0 },
        },
        max_wait_ms: 10,
        ..SessionConfig::default()
    }
}

fn server() -> UserSession {
    Session::server(loopback_config(), UserStream::new(), UserStream::new()).expect("サーバーを開けない")
}

fn client_for(server: &UserSession, key: &str) -> UserSession {
    let port = server.port().expect("サーバーのポートが分からない");
    let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    Session::client(loopback_config(), key, remote, UserStream::new(), UserStream::new())
        .expect("クライアントを開けない")
}

/// 両方のループを交互にまわし、`done` が真になるか時間切れまで待つ
fn pump(
    client: &mut UserSession,
    server: &mut UserSession,
    timeout: Duration,
    mut done: impl FnMut(&mut UserSession, &mut UserSession) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        client.run_once().expect("クライアントのループが失敗");
        server.run_once().expect("サーバーのループが失敗");
        if done(client, server) {
            return true;
        }
    }
    false
}

/// サーバーが受け取ったユーザー入力を `seen` に積み上げる
fn collect_input(server: &mut UserSession, seen: &mut UserStream) {
    let diff = server.get_remote_diff();
    if !diff.is_empty() {
        seen.apply_string(&diff).expect("受け取った diff が適用できない");
    }
}

// ==============================================================
// テスト
// ==============================================================

/// キー入力とリサイズがサーバーに届く
#[test]
fn test_user_input_reaches_server() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    client.current_state_mut().push_resize(80, 24);
    client.current_state_mut().push_keystrokes(b"hello");

    let mut seen = UserStream::new();
    let ok = pump(&mut client, &mut server, Duration::from_secs(5), |_, s| {
        collect_input(s, &mut seen);
        seen.keystrokes() == b"hello"
    });

    assert!(ok, "5 秒以内に入力が届かない: {seen}");
    assert_eq!(seen.get(0), Some(&UserEvent::Resize { cols: 80, rows: 24 }));
    assert!(server.transport().has_remote_addr(), "サーバーがクライアントに接続している");
    assert_eq!(
        server.remote_addr().map(|a| a.port()),
        client.port(),
        "サーバーはクライアントのアドレスに返信する"
    );
}

/// 続けて入力しても差分だけが届き、順序どおりに積み上がる
#[test]
fn test_incremental_input_converges() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    let mut seen = UserStream::new();
    let mut expected = Vec::new();
    for chunk in [&b"ls"[..], b" -la", b"\r", b"exit\r"] {
        client.current_state_mut().push_keystrokes(chunk);
        expected.extend_from_slice(chunk);

        let ok = pump(&mut client, &mut server, Duration::from_secs(5), |_, s| {
            collect_input(s, &mut seen);
            seen.keystrokes() == expected
        });
        assert!(ok, "{:?} の後で収束しない: {seen}", String::from_utf8_lossy(chunk));
    }
}

/// MTU を超える状態は複数の Fragment に分かれて届く
#[test]
fn test_large_input_is_fragmented() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    // 圧縮で縮まないように疑似乱数で埋める
    let mut x: u32 = 0x1234_5678;
    let big: Vec<u8> = (0..6000)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect();
    client.current_state_mut().push_keystrokes(&big);

    let mut seen = UserStream::new();
    let ok = pump(&mut client, &mut server, Duration::from_secs(5), |_, s| {
        collect_input(s, &mut seen);
        seen.len() >= big.len()
    });

    assert!(ok, "大きな入力が届かない（{} / {} バイト）", seen.len(), big.len());
    assert_eq!(seen.keystrokes(), big);
}

/// シャットダウンの ack が往復する
#[test]
fn test_shutdown_handshake() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    // まず接続を確立する
    let connected = pump(&mut client, &mut server, Duration::from_secs(5), |c, s| {
        s.transport().has_remote_addr() && c.stats().acked_num > 0
    });
    assert!(connected, "接続が確立しない");

    client.start_shutdown();
    let ok = pump(&mut client, &mut server, Duration::from_secs(5), |c, s| {
        c.shutdown_finished() && s.transport().counterparty_shutdown_ack_sent()
    });

    assert!(ok, "シャットダウンが終わらない");
    assert!(client.transport().shutdown_acknowledged(), "タイムアウトではなく ack で終わる");
    assert_eq!(server.transport().remote_state_num(), SHUTDOWN_NUM);
}

/// 相手がいなくなったらシャットダウンは再送の上限で諦める
#[test]
fn test_shutdown_gives_up_without_peer() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    let connected = pump(&mut client, &mut server, Duration::from_secs(5), |c, _| c.stats().acked_num > 0);
    assert!(connected, "接続が確立しない");
    drop(server);

    let started = Instant::now();
    let acknowledged = client.shutdown().expect("シャットダウン中のループが失敗");

    assert!(!acknowledged, "ack は返ってこない");
    assert!(client.shutdown_finished());
    assert!(client.transport().sender().shutdown_tries() > 16 || started.elapsed() >= Duration::from_secs(10));
    assert!(!client.transport().shutdown_acknowledged());
}

/// やり取りが続いている間は休止からの復帰とみなさない
#[test]
fn test_no_awaken_while_active() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    client.current_state_mut().push_keystrokes(b"x");
    let mut seen = UserStream::new();
    let ok = pump(&mut client, &mut server, Duration::from_secs(5), |_, s| {
        collect_input(s, &mut seen);
        seen.keystrokes() == b"x"
    });
    assert!(ok, "入力が届かない");

    assert!(!client.awaken());
    assert!(!server.awaken());
}

/// 鍵が違うクライアントのデータグラムは捨てられる
#[test]
fn test_wrong_key_is_ignored() {
    let mut server = server();
    let other_key = Base64Key::random().expect("鍵を生成できない").printable();
    let mut client = client_for(&server, &other_key);

    client.current_state_mut().push_keystrokes(b"intruder");

    let attached = pump(&mut client, &mut server, Duration::from_millis(500), |_, s| {
        s.transport().has_remote_addr()
    });

    assert!(!attached, "認証できないデータグラムでサーバーが接続先を変えてはいけない");
    assert_eq!(server.transport().remote_state_num(), 0);
}

/// 統計情報が JSON で取り出せる
#[test]
fn test_stats_after_exchange() {
    let mut server = server();
    let key = server.key();
    let mut client = client_for(&server, &key);

    let ok = pump(&mut client, &mut server, Duration::from_secs(5), |c, _| c.stats().acked_num > 0);
    assert!(ok, "ack が返ってこない");

    let stats = serde_json::to_value(client.stats()).expect("統計情報をシリアライズできない");
    assert!(stats["srtt_ms"].as_f64().unwrap() < 1000.0, "RTT のサンプルが取れている");
    assert!(stats["mtu"].as_u64().unwrap() > 500);
    assert_eq!(stats["shutdown_in_progress"], false);
}
