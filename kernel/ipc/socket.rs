//! UNIX-domain sockets
//!
//! Stream and datagram sockets over an in-kernel path namespace.
//! Stream connections pair two rings (one per direction); datagram
//! sockets queue whole messages at the bound peer. Status values stay
//! typed until the syscall boundary.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::poll::PollStatus;

use super::fifo::Fifo;

/// Outcome of a socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockStatus {
    PlainSuccess,
    /// Operation invalid for this socket's type or state.
    IsBadType,
    WouldBlock,
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
}

/// A connected stream: two rings, one per direction.
struct StreamPeer {
    /// Data flowing toward this socket.
    incoming: Arc<Fifo>,
    /// Data flowing toward the remote socket.
    outgoing: Arc<Fifo>,
}

/// One queued datagram.
struct Datagram {
    payload: Vec<u8>,
}

enum SocketState {
    Fresh,
    Listening {
        backlog: usize,
        pending: VecDeque<Arc<UnixSocket>>,
    },
    Connected(StreamPeer),
    /// Datagram socket bound and receiving.
    DatagramBound {
        queue: VecDeque<Datagram>,
    },
}

/// A UNIX-domain socket.
pub struct UnixSocket {
    pub kind: SockType,
    nonblocking: ::core::sync::atomic::AtomicBool,
    state: Mutex<SocketState>,
    bound_path: Mutex<Option<String>>,
}

/// The path namespace: bound sockets by absolute path.
static NAMESPACE: Mutex<Vec<(String, Arc<UnixSocket>)>> = Mutex::new(Vec::new());

impl UnixSocket {
    pub fn new(kind: SockType, nonblocking: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            nonblocking: ::core::sync::atomic::AtomicBool::new(nonblocking),
            state: Mutex::new(SocketState::Fresh),
            bound_path: Mutex::new(None),
        })
    }

    pub fn nonblocking(&self) -> bool {
        self.nonblocking.load(::core::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_nonblocking(&self, value: bool) {
        self.nonblocking
            .store(value, ::core::sync::atomic::Ordering::Relaxed);
    }

    /// Bind to a path in the namespace.
    pub fn bind(self: &Arc<Self>, path: &str) -> SockStatus {
        let mut namespace = NAMESPACE.lock();
        if namespace.iter().any(|(p, _)| p == path) {
            return SockStatus::IsBadType;
        }
        if self.bound_path.lock().is_some() {
            return SockStatus::IsBadType;
        }
        if self.kind == SockType::Datagram {
            *self.state.lock() = SocketState::DatagramBound {
                queue: VecDeque::new(),
            };
        }
        *self.bound_path.lock() = Some(String::from(path));
        namespace.push((String::from(path), self.clone()));
        SockStatus::PlainSuccess
    }

    /// Put a bound stream socket into the listening state.
    pub fn listen(&self, backlog: usize) -> SockStatus {
        if self.kind != SockType::Stream || self.bound_path.lock().is_none() {
            return SockStatus::IsBadType;
        }
        let mut state = self.state.lock();
        match *state {
            SocketState::Fresh => {
                *state = SocketState::Listening {
                    backlog: backlog.max(1),
                    pending: VecDeque::new(),
                };
                SockStatus::PlainSuccess
            }
            _ => SockStatus::IsBadType,
        }
    }

    /// Connect a stream socket to a listening path.
    pub fn connect(self: &Arc<Self>, path: &str) -> SockStatus {
        if self.kind != SockType::Stream {
            return SockStatus::IsBadType;
        }
        {
            let state = self.state.lock();
            if !matches!(*state, SocketState::Fresh) {
                return SockStatus::IsBadType;
            }
        }

        let target = {
            let namespace = NAMESPACE.lock();
            namespace
                .iter()
                .find(|(p, _)| p == path)
                .map(|(_, s)| s.clone())
        };
        let Some(target) = target else {
            return SockStatus::IsBadType;
        };

        // Build the two directions once, shared by both halves.
        let a_to_b = Fifo::new();
        let b_to_a = Fifo::new();

        let server_half = UnixSocket::new(SockType::Stream, false);
        *server_half.state.lock() = SocketState::Connected(StreamPeer {
            incoming: a_to_b.clone(),
            outgoing: b_to_a.clone(),
        });

        {
            let mut state = target.state.lock();
            match &mut *state {
                SocketState::Listening { backlog, pending } => {
                    if pending.len() >= *backlog {
                        return SockStatus::WouldBlock;
                    }
                    pending.push_back(server_half);
                }
                _ => return SockStatus::IsBadType,
            }
        }

        *self.state.lock() = SocketState::Connected(StreamPeer {
            incoming: b_to_a,
            outgoing: a_to_b,
        });
        SockStatus::PlainSuccess
    }

    /// Accept one pending connection; `WouldBlock` when none waits.
    pub fn accept(&self) -> Result<Arc<UnixSocket>, SockStatus> {
        let mut state = self.state.lock();
        match &mut *state {
            SocketState::Listening { pending, .. } => match pending.pop_front() {
                Some(sock) => Ok(sock),
                None => Err(SockStatus::WouldBlock),
            },
            _ => Err(SockStatus::IsBadType),
        }
    }

    /// Send on a connected stream or to a bound datagram path.
    pub fn send(&self, data: &[u8], dgram_target: Option<&str>) -> Result<usize, SockStatus> {
        match self.kind {
            SockType::Stream => {
                let state = self.state.lock();
                let SocketState::Connected(peer) = &*state else {
                    return Err(SockStatus::IsBadType);
                };
                let (n, _) = peer.outgoing.try_write(data);
                if n == 0 && !data.is_empty() {
                    Err(SockStatus::WouldBlock)
                } else {
                    Ok(n)
                }
            }
            SockType::Datagram => {
                let Some(path) = dgram_target else {
                    return Err(SockStatus::IsBadType);
                };
                let target = {
                    let namespace = NAMESPACE.lock();
                    namespace
                        .iter()
                        .find(|(p, _)| p == path)
                        .map(|(_, s)| s.clone())
                };
                let Some(target) = target else {
                    return Err(SockStatus::IsBadType);
                };
                let mut state = target.state.lock();
                match &mut *state {
                    SocketState::DatagramBound { queue } => {
                        queue.push_back(Datagram {
                            payload: data.to_vec(),
                        });
                        Ok(data.len())
                    }
                    _ => Err(SockStatus::IsBadType),
                }
            }
        }
    }

    /// Receive from a connected stream or this socket's datagram
    /// queue.
    pub fn receive(&self, out: &mut [u8]) -> Result<usize, SockStatus> {
        match self.kind {
            SockType::Stream => {
                let state = self.state.lock();
                let SocketState::Connected(peer) = &*state else {
                    return Err(SockStatus::IsBadType);
                };
                let (n, status) = peer.incoming.try_read(out);
                match status {
                    super::fifo::PipeStatus::WouldBlock => Err(SockStatus::WouldBlock),
                    _ => Ok(n),
                }
            }
            SockType::Datagram => {
                let mut state = self.state.lock();
                match &mut *state {
                    SocketState::DatagramBound { queue } => match queue.pop_front() {
                        Some(dgram) => {
                            let n = dgram.payload.len().min(out.len());
                            out[..n].copy_from_slice(&dgram.payload[..n]);
                            Ok(n)
                        }
                        None => Err(SockStatus::WouldBlock),
                    },
                    _ => Err(SockStatus::IsBadType),
                }
            }
        }
    }

    /// Drop this socket's binding from the namespace.
    pub fn unbind(&self) {
        if let Some(path) = self.bound_path.lock().take() {
            let mut namespace = NAMESPACE.lock();
            namespace.retain(|(p, _)| *p != path);
        }
    }

    /// Readiness snapshot.
    pub fn poll_status(&self) -> PollStatus {
        let state = self.state.lock();
        match &*state {
            SocketState::Fresh => PollStatus::default(),
            SocketState::Listening { pending, .. } => PollStatus {
                can_read: !pending.is_empty(),
                can_write: false,
                is_error: false,
                is_broken: false,
            },
            SocketState::Connected(peer) => PollStatus {
                can_read: peer.incoming.buffered() > 0,
                can_write: peer.outgoing.buffered() < super::fifo::FIFO_CAPACITY,
                is_error: false,
                is_broken: !peer.incoming.has_writers(),
            },
            SocketState::DatagramBound { queue } => PollStatus {
                can_read: !queue.is_empty(),
                can_write: true,
                is_error: false,
                is_broken: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The namespace is shared process-wide; tests use unique paths.

    #[test]
    fn stream_connect_and_exchange() {
        let server = UnixSocket::new(SockType::Stream, false);
        assert_eq!(server.bind("/tmp/t-stream-1"), SockStatus::PlainSuccess);
        assert_eq!(server.listen(4), SockStatus::PlainSuccess);

        let client = UnixSocket::new(SockType::Stream, false);
        assert_eq!(client.connect("/tmp/t-stream-1"), SockStatus::PlainSuccess);

        let conn = server.accept().expect("pending connection");
        assert_eq!(client.send(b"ping", None), Ok(4));

        let mut buf = [0u8; 8];
        assert_eq!(conn.receive(&mut buf), Ok(4));
        assert_eq!(&buf[..4], b"ping");

        // And the reverse direction
        assert_eq!(conn.send(b"pong!", None), Ok(5));
        assert_eq!(client.receive(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"pong!");

        server.unbind();
    }

    #[test]
    fn accept_without_pending_would_block() {
        let server = UnixSocket::new(SockType::Stream, true);
        server.bind("/tmp/t-stream-2");
        server.listen(1);
        assert!(matches!(server.accept(), Err(SockStatus::WouldBlock)));
        server.unbind();
    }

    #[test]
    fn double_bind_rejected() {
        let a = UnixSocket::new(SockType::Stream, false);
        let b = UnixSocket::new(SockType::Stream, false);
        assert_eq!(a.bind("/tmp/t-bind-1"), SockStatus::PlainSuccess);
        assert_eq!(b.bind("/tmp/t-bind-1"), SockStatus::IsBadType);
        a.unbind();
    }

    #[test]
    fn datagrams_preserve_boundaries() {
        let receiver = UnixSocket::new(SockType::Datagram, false);
        assert_eq!(receiver.bind("/tmp/t-dgram-1"), SockStatus::PlainSuccess);

        let sender = UnixSocket::new(SockType::Datagram, false);
        assert_eq!(sender.send(b"first", Some("/tmp/t-dgram-1")), Ok(5));
        assert_eq!(sender.send(b"second!", Some("/tmp/t-dgram-1")), Ok(7));

        let mut buf = [0u8; 64];
        assert_eq!(receiver.receive(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"first");
        assert_eq!(receiver.receive(&mut buf), Ok(7));
        assert_eq!(&buf[..7], b"second!");
        assert!(matches!(
            receiver.receive(&mut buf),
            Err(SockStatus::WouldBlock)
        ));

        receiver.unbind();
    }

    #[test]
    fn listen_requires_bound_stream() {
        let sock = UnixSocket::new(SockType::Stream, false);
        assert_eq!(sock.listen(4), SockStatus::IsBadType);

        let dgram = UnixSocket::new(SockType::Datagram, false);
        dgram.bind("/tmp/t-dgram-2");
        assert_eq!(dgram.listen(4), SockStatus::IsBadType);
        dgram.unbind();
    }

    #[test]
    fn connect_to_missing_path_fails() {
        let sock = UnixSocket::new(SockType::Stream, false);
        assert_eq!(sock.connect("/tmp/t-none"), SockStatus::IsBadType);
    }
}
