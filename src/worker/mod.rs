//! FSM-driven protocol sessions multiplexed by the reactor.
//!
//! A [`ProtocolWorker`] binds an accepted (server role) or connected
//! (client role) socket to an [`Fsm`] whose transitions encode the dialog:
//! each newline-terminated token read from the peer is fed to the machine,
//! and whatever the transition actions emit is queued and flushed as the
//! socket becomes writable. When the machine reaches its designated
//! terminal state the session flushes, closes, and deregisters itself.

use std::cell::Cell;
use std::fmt::Debug;
use std::hash::Hash;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::fsm::Fsm;
use crate::reactor::{EventHandler, Flow};

const READ_CHUNK: usize = 4096;

/// Where a protocol session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed but not yet registered with a reactor.
    Uninitialized,
    /// Registered; the dialog is in progress.
    Running,
    /// Dialog over (terminal state, peer close, or violation); flushing
    /// pending output before the socket closes.
    Closing,
    /// Socket closed and registration gone. Terminal.
    Closed,
}

/// Observer for a session's phase, usable after the reactor has taken
/// ownership of the worker.
#[derive(Clone)]
pub struct SessionMonitor {
    phase: Rc<Cell<SessionPhase>>,
    violation: Rc<Cell<bool>>,
}

impl SessionMonitor {
    /// The session's current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase.get()
    }

    /// Whether the dialog ended on a protocol violation (an input the FSM
    /// had no transition for).
    pub fn protocol_violation(&self) -> bool {
        self.violation.get()
    }
}

/// An event-driven protocol session over one socket.
///
/// # Examples
///
/// ```no_run
/// use marionette::fsm::{action, Fsm};
/// use marionette::{Interest, ProtocolWorker, Reactor};
///
/// # async fn example(stream: std::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
/// let mut fsm = Fsm::new(0);
/// fsm.add_exact("HELLO", 0, action(|_, r| Ok(r.emit_line("WELCOME"))), 1);
/// fsm.add_exact("QUIT", 1, None, 2);
///
/// let worker = ProtocolWorker::new(stream, fsm, 2)?;
/// let monitor = worker.monitor();
///
/// let mut reactor = Reactor::new();
/// reactor.register(Interest::both(), Box::new(worker))?;
/// reactor.run().await?;
/// assert_eq!(monitor.phase(), marionette::SessionPhase::Closed);
/// # Ok(())
/// # }
/// ```
pub struct ProtocolWorker<S> {
    stream: TcpStream,
    fsm: Fsm<S>,
    terminal: S,
    opening: Option<Vec<u8>>,
    inbuf: BytesMut,
    outq: BytesMut,
    phase: Rc<Cell<SessionPhase>>,
    violation: Rc<Cell<bool>>,
}

impl<S: Copy + Eq + Hash + Debug> ProtocolWorker<S> {
    /// Bind `stream` to `fsm`; the session ends when the machine reaches
    /// `terminal`. The socket is switched to non-blocking mode.
    pub fn new(stream: TcpStream, fsm: Fsm<S>, terminal: S) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            fsm,
            terminal,
            opening: None,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            outq: BytesMut::new(),
            phase: Rc::new(Cell::new(SessionPhase::Uninitialized)),
            violation: Rc::new(Cell::new(false)),
        })
    }

    /// Queue bytes to send as soon as the worker is registered: the
    /// opening message of a client role.
    pub fn with_opening(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.opening = Some(bytes.into());
        self
    }

    /// A phase observer that outlives handing the worker to the reactor.
    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            phase: Rc::clone(&self.phase),
            violation: Rc::clone(&self.violation),
        }
    }

    /// Feed complete tokens out of the input buffer to the FSM. Returns a
    /// directive when the session should wind down.
    fn feed_tokens(&mut self) -> Option<Flow> {
        while let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
            let line = self.inbuf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line);
            let token = text.trim_end_matches(['\r', '\n']);
            match self.fsm.process(token) {
                Ok(next) => {
                    for out in self.fsm.take_output() {
                        self.outq.extend_from_slice(&out);
                    }
                    if next == self.terminal {
                        return Some(self.begin_close("dialog complete"));
                    }
                }
                Err(err) => {
                    warn!(token, error = %err, "protocol violation, aborting session");
                    self.violation.set(true);
                    return Some(self.begin_close("protocol violation"));
                }
            }
        }
        None
    }

    fn begin_close(&mut self, reason: &str) -> Flow {
        debug!(fd = self.stream.as_raw_fd(), reason, "session closing");
        self.phase.set(SessionPhase::Closing);
        if self.outq.is_empty() {
            self.finish()
        } else {
            Flow::Continue
        }
    }

    fn finish(&mut self) -> Flow {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.phase.set(SessionPhase::Closed);
        Flow::Deregister
    }

    fn fail(&mut self) -> Flow {
        self.phase.set(SessionPhase::Closed);
        Flow::Deregister
    }
}

impl<S> AsRawFd for ProtocolWorker<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl<S: Copy + Eq + Hash + Debug> EventHandler for ProtocolWorker<S> {
    fn wants_read(&self) -> bool {
        self.phase.get() == SessionPhase::Running
    }

    fn wants_write(&self) -> bool {
        !self.outq.is_empty()
    }

    fn on_register(&mut self) -> Flow {
        if let Some(opening) = self.opening.take() {
            self.outq.extend_from_slice(&opening);
        }
        self.phase.set(SessionPhase::Running);
        Flow::Continue
    }

    fn on_readable(&mut self) -> Flow {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return self.begin_close("peer closed"),
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if let Some(flow) = self.feed_tokens() {
                        return flow;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "read failed, dropping session");
                    return self.fail();
                }
            }
        }
    }

    fn on_writable(&mut self) -> Flow {
        while !self.outq.is_empty() {
            match self.stream.write(&self.outq) {
                Ok(0) => return self.fail(),
                Ok(n) => self.outq.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "write failed, dropping session");
                    return self.fail();
                }
            }
        }
        if self.phase.get() == SessionPhase::Closing {
            self.finish()
        } else {
            Flow::Continue
        }
    }

    fn on_error(&mut self, error: &io::Error) -> Flow {
        warn!(error = %error, "socket error, dropping session");
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::action;
    use crate::reactor::{Interest, Reactor};
    use std::net::TcpListener;
    use std::time::Duration;

    fn read_line(sock: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = sock.read(&mut byte).unwrap();
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn client_sends_opening_and_closes_on_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            assert_eq!(read_line(&mut sock), "PING");
            sock.write_all(b"PONG\n").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut fsm = Fsm::new(0);
        fsm.add_exact("PONG", 0, None, 1);
        let worker = ProtocolWorker::new(stream, fsm, 1)
            .unwrap()
            .with_opening(b"PING\n".to_vec());
        let monitor = worker.monitor();
        assert_eq!(monitor.phase(), SessionPhase::Uninitialized);

        let mut reactor = Reactor::new();
        reactor.register(Interest::both(), Box::new(worker)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reactor.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(monitor.phase(), SessionPhase::Closed);
        assert!(!monitor.protocol_violation());
        peer.join().unwrap();
    }

    #[tokio::test]
    async fn unknown_token_is_a_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"GARBAGE\n").unwrap();
            // Hold the socket open so EOF is not what ends the dialog.
            let mut rest = Vec::new();
            let _ = sock.read_to_end(&mut rest);
        });

        let stream = TcpStream::connect(addr).unwrap();
        let fsm: Fsm<u8> = Fsm::new(0);
        let worker = ProtocolWorker::new(stream, fsm, 1).unwrap();
        let monitor = worker.monitor();

        let mut reactor = Reactor::new();
        reactor.register(Interest::both(), Box::new(worker)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reactor.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(monitor.phase(), SessionPhase::Closed);
        assert!(monitor.protocol_violation());
        peer.join().unwrap();
    }

    #[tokio::test]
    async fn reply_is_flushed_before_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let mut sock = TcpStream::connect(addr).unwrap();
            sock.write_all(b"HELLO\n").unwrap();
            assert_eq!(read_line(&mut sock), "WELCOME");
        });

        let (stream, _) = listener.accept().unwrap();
        let mut fsm = Fsm::new(0);
        fsm.add_exact("HELLO", 0, action(|_, r| Ok(r.emit_line("WELCOME"))), 1);
        let worker = ProtocolWorker::new(stream, fsm, 1).unwrap();
        let monitor = worker.monitor();

        let mut reactor = Reactor::new();
        reactor.register(Interest::both(), Box::new(worker)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reactor.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(monitor.phase(), SessionPhase::Closed);
        peer.join().unwrap();
    }
}
