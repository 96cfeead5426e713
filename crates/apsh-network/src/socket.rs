//! UDP ソケットの生成と ECN 付き受信
//!
//! - 送信側: IP_TOS（IPv6 は IPV6_TCLASS）に DSCP AF42 + ECT(0) を付ける
//! - 受信側: IP_RECVTOS / IPV6_RECVTCLASS で TOS を補助データとして受け取り、
//!   ECN が CE（0b11）なら輻輳ありとして呼び出し側に伝える
//!
//! ソケットオプションの失敗は致命的ではない（ECN なしで動作を続ける）。

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

/// DSCP AF42 (0x90) | ECT(0) (0x02)
const TOS_AF42_ECT0: libc::c_int = 0x92;

/// ECN フィールドが CE（Congestion Experienced）
const ECN_CE: u8 = 0x03;

/// 補助データ用バッファ（cmsghdr の整列を保つため u64 で確保）
const CONTROL_WORDS: usize = 8;

/// 1 回の受信結果
#[derive(Debug)]
pub(crate) struct Datagram {
    pub len: usize,
    pub source: Option<SocketAddr>,
    pub congestion_experienced: bool,
    /// バッファに収まらず切り詰められた
    pub truncated: bool,
}

/// ノンブロッキングの UDP ソケットを作る（まだバインドしない）
fn new_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    mark_ecn(&socket, addr.is_ipv6());
    Ok(socket)
}

/// `local` にバインドしたソケット（サーバー用）
pub(crate) fn bind(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(&local)?;
    socket.bind(&local.into())?;
    Ok(socket.into())
}

/// `remote` に connect したソケット（クライアント用、ローカルポートは OS 任せ）
pub(crate) fn dial(remote: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(&remote)?;
    socket.connect(&remote.into())?;
    Ok(socket.into())
}

fn mark_ecn(socket: &Socket, ipv6: bool) {
    let fd = socket.as_raw_fd();
    let (level, tos_opt, recv_opt) = if ipv6 {
        (libc::IPPROTO_IPV6, libc::IPV6_TCLASS, libc::IPV6_RECVTCLASS)
    } else {
        (libc::IPPROTO_IP, libc::IP_TOS, libc::IP_RECVTOS)
    };

    if let Err(e) = set_int_option(fd, level, tos_opt, TOS_AF42_ECT0) {
        warn!(error = %e, "failed to mark outgoing datagrams ECN-capable");
    }
    if let Err(e) = set_int_option(fd, level, recv_opt, 1) {
        warn!(error = %e, "failed to request TOS on received datagrams");
    }
}

fn set_int_option(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// いずれかのソケットが読み込み可能になるまで最大 `timeout_ms` 待つ
///
/// # 戻り値
/// 読み込み可能なソケットがあれば `true`。タイムアウトとシグナル割り込みは `false`。
pub(crate) fn wait_readable(sockets: &[UdpSocket], timeout_ms: u64) -> io::Result<bool> {
    let mut fds: Vec<libc::pollfd> = sockets
        .iter()
        .map(|s| libc::pollfd {
            fd: s.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout = timeout_ms.min(libc::c_int::MAX as u64) as libc::c_int;

    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ret > 0)
}

/// データグラムを 1 つ、ブロックせずに読む
///
/// 読むものがなければ `io::ErrorKind::WouldBlock` を返す。
pub(crate) fn recv_with_ecn(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut control = [0u64; CONTROL_WORDS];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut libc::sockaddr_storage as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(Datagram {
        len: n as usize,
        source: sockaddr_to_std(&storage),
        congestion_experienced: congestion_experienced(&msg),
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
    })
}

fn congestion_experienced(msg: &libc::msghdr) -> bool {
    let mut ce = false;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let ty = (*cmsg).cmsg_type;
            let data = libc::CMSG_DATA(cmsg);

            if level == libc::IPPROTO_IP && (ty == libc::IP_TOS || ty == libc::IP_RECVTOS) {
                // IPv4 の TOS は 1 バイト
                ce = *data & ECN_CE == ECN_CE;
            } else if level == libc::IPPROTO_IPV6 && ty == libc::IPV6_TCLASS {
                // IPv6 の traffic class は int
                let tclass = std::ptr::read_unaligned(data as *const libc::c_int);
                ce = (tclass as u8) & ECN_CE == ECN_CE;
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    ce
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
