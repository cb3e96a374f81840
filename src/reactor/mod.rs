//! Single-threaded cooperative I/O reactor.
//!
//! The reactor multiplexes readiness over every registered descriptor and
//! dispatches to the owning [`EventHandler`]. It is strictly cooperative:
//! handler callbacks run on the reactor's task and must never block;
//! long-running work belongs to the process supervisor or to further
//! reactor-driven steps.
//!
//! Registered descriptors must be in non-blocking mode. Readiness is
//! cleared before dispatch, so a handler must drain its descriptor until
//! `WouldBlock` or it will stall waiting for an edge that already passed.
//!
//! Handlers steer their own registration through the returned [`Flow`]
//! directive: once a handler returns [`Flow::Deregister`] (or
//! [`Reactor::unregister`] is called between turns) no further callbacks
//! are delivered for that descriptor, even for events collected in the
//! same iteration.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::task::Poll;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::result::ReactorError;

/// Which readiness conditions a registration subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Readability only.
    pub const READABLE: Interest = Interest(0b01);
    /// Writability only.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Readability and writability.
    pub fn both() -> Interest {
        Interest(0b11)
    }

    /// Whether read events are subscribed.
    pub fn is_readable(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// Whether write events are subscribed.
    pub fn is_writable(self) -> bool {
        self.0 & 0b10 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Directive returned by handler callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the registration.
    Continue,
    /// Remove this registration; no further callbacks follow.
    Deregister,
    /// Stop the reactor loop at the end of this iteration.
    Stop,
}

/// Callbacks for one registered descriptor.
///
/// `wants_read`/`wants_write` are consulted every iteration and refine the
/// registered [`Interest`], so a handler only receives write events while
/// it actually has something to write.
pub trait EventHandler: AsRawFd {
    /// Whether read readiness should currently be watched.
    fn wants_read(&self) -> bool {
        true
    }

    /// Whether write readiness should currently be watched.
    fn wants_write(&self) -> bool {
        false
    }

    /// Invoked once when the handler is registered.
    fn on_register(&mut self) -> Flow {
        Flow::Continue
    }

    /// The descriptor is readable; drain it until `WouldBlock`.
    fn on_readable(&mut self) -> Flow;

    /// The descriptor is writable; flush until done or `WouldBlock`.
    fn on_writable(&mut self) -> Flow {
        Flow::Continue
    }

    /// Readiness polling failed for the descriptor.
    fn on_error(&mut self, error: &io::Error) -> Flow {
        let _ = error;
        Flow::Deregister
    }
}

// AsyncFd needs an AsRawFd owner; boxed trait objects don't carry the
// std blanket impls we'd want, so wrap them.
struct Handler(Box<dyn EventHandler>);

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

struct Registration {
    io: AsyncFd<Handler>,
    interest: Interest,
}

enum Event {
    Readable(RawFd),
    Writable(RawFd),
    Failed(RawFd, io::Error),
}

impl Event {
    fn fd(&self) -> RawFd {
        match self {
            Event::Readable(fd) | Event::Writable(fd) | Event::Failed(fd, _) => *fd,
        }
    }
}

/// A single-threaded readiness-dispatch loop over registered descriptors.
///
/// # Examples
///
/// ```no_run
/// use marionette::{Interest, Reactor};
///
/// # async fn example(worker: Box<dyn marionette::EventHandler>) -> Result<(), Box<dyn std::error::Error>> {
/// let mut reactor = Reactor::new();
/// reactor.register(Interest::both(), worker)?;
/// reactor.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Reactor {
    registrations: HashMap<RawFd, Registration>,
    tick: Option<Duration>,
    stopped: bool,
}

impl Reactor {
    /// An empty reactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each multiplex wait, so [`run`](Self::run) wakes periodically
    /// even with no events.
    pub fn set_tick(&mut self, tick: Option<Duration>) {
        self.tick = tick;
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether no descriptors are registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Register a handler under its descriptor.
    ///
    /// Must be called from within a tokio runtime. The descriptor must be
    /// non-blocking and not already registered.
    ///
    /// # Errors
    ///
    /// [`ReactorError::AlreadyRegistered`] if the descriptor has a live
    /// registration.
    pub fn register(
        &mut self,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> Result<RawFd, ReactorError> {
        let fd = handler.as_raw_fd();
        if self.registrations.contains_key(&fd) {
            return Err(ReactorError::AlreadyRegistered { fd });
        }
        let io = AsyncFd::new(Handler(handler))?;
        self.registrations.insert(fd, Registration { io, interest });
        trace!(fd, "registered descriptor");

        if let Some(reg) = self.registrations.get_mut(&fd) {
            match reg.io.get_mut().0.on_register() {
                Flow::Continue => {}
                Flow::Deregister => {
                    self.registrations.remove(&fd);
                }
                Flow::Stop => self.stopped = true,
            }
        }
        Ok(fd)
    }

    /// Drop a registration. Its handler (and descriptor) are released and
    /// receive no further callbacks.
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        match self.registrations.remove(&fd) {
            Some(_) => {
                trace!(fd, "unregistered descriptor");
                Ok(())
            }
            None => Err(ReactorError::NotRegistered { fd }),
        }
    }

    /// Drop every registration.
    pub fn unregister_all(&mut self) {
        self.registrations.clear();
    }

    /// Request the loop to stop at the next iteration boundary.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Run until every registration is gone or a handler (or
    /// [`stop`](Self::stop)) ends the loop.
    pub async fn run(&mut self) -> Result<(), ReactorError> {
        self.stopped = false;
        while !self.stopped && !self.registrations.is_empty() {
            self.turn(self.tick).await?;
        }
        Ok(())
    }

    /// One iteration: wait for readiness (bounded by `timeout` if given),
    /// then dispatch every collected event. Returns the number of
    /// callbacks dispatched; 0 on a timed-out wait.
    pub async fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, ReactorError> {
        let events = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.collect_events()).await {
                Ok(events) => events,
                Err(_) => return Ok(0),
            },
            None => self.collect_events().await,
        };

        let mut dispatched = 0;
        for event in events {
            let fd = event.fd();
            // Skip events for descriptors deregistered earlier this turn.
            let Some(reg) = self.registrations.get_mut(&fd) else {
                continue;
            };
            let handler = &mut reg.io.get_mut().0;
            let flow = match &event {
                Event::Readable(_) => handler.on_readable(),
                Event::Writable(_) => handler.on_writable(),
                Event::Failed(_, error) => handler.on_error(error),
            };
            dispatched += 1;
            match flow {
                Flow::Continue => {}
                Flow::Deregister => {
                    self.registrations.remove(&fd);
                    trace!(fd, "handler deregistered itself");
                }
                Flow::Stop => self.stopped = true,
            }
        }
        Ok(dispatched)
    }

    /// Wait until at least one registration is ready, clearing readiness
    /// as events are collected.
    async fn collect_events(&mut self) -> Vec<Event> {
        std::future::poll_fn(|cx| {
            let mut events = Vec::new();
            for (fd, reg) in self.registrations.iter_mut() {
                let wants_read = reg.interest.is_readable() && reg.io.get_ref().0.wants_read();
                let wants_write = reg.interest.is_writable() && reg.io.get_ref().0.wants_write();

                if wants_read {
                    match reg.io.poll_read_ready_mut(cx) {
                        Poll::Ready(Ok(mut guard)) => {
                            guard.clear_ready();
                            events.push(Event::Readable(*fd));
                        }
                        Poll::Ready(Err(e)) => events.push(Event::Failed(*fd, e)),
                        Poll::Pending => {}
                    }
                }
                if wants_write {
                    match reg.io.poll_write_ready_mut(cx) {
                        Poll::Ready(Ok(mut guard)) => {
                            guard.clear_ready();
                            events.push(Event::Writable(*fd));
                        }
                        Poll::Ready(Err(e)) => events.push(Event::Failed(*fd, e)),
                        Poll::Pending => {}
                    }
                }
            }
            if events.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(events)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    struct Idle(UnixStream);

    impl AsRawFd for Idle {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl EventHandler for Idle {
        fn wants_read(&self) -> bool {
            false
        }

        fn on_readable(&mut self) -> Flow {
            Flow::Continue
        }
    }

    struct SameFd(RawFd);

    impl AsRawFd for SameFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    impl EventHandler for SameFd {
        fn on_readable(&mut self) -> Flow {
            Flow::Continue
        }
    }

    fn idle_pair() -> (Idle, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Idle(a), b)
    }

    #[test]
    fn interest_masks() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.is_readable() && rw.is_writable());
        assert!(!Interest::WRITABLE.is_readable());
        assert_eq!(rw, Interest::both());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (handler, _peer) = idle_pair();
        let fd = handler.as_raw_fd();
        let mut reactor = Reactor::new();
        reactor
            .register(Interest::READABLE, Box::new(handler))
            .unwrap();
        let err = reactor
            .register(Interest::READABLE, Box::new(SameFd(fd)))
            .unwrap_err();
        assert!(matches!(err, ReactorError::AlreadyRegistered { .. }));
        assert_eq!(reactor.len(), 1);
    }

    #[tokio::test]
    async fn unregister_unknown_descriptor_fails() {
        let mut reactor = Reactor::new();
        let err = reactor.unregister(42).unwrap_err();
        assert!(matches!(err, ReactorError::NotRegistered { fd: 42 }));
    }

    #[tokio::test]
    async fn idle_turn_times_out_cleanly() {
        let (handler, _peer) = idle_pair();
        let mut reactor = Reactor::new();
        reactor
            .register(Interest::READABLE, Box::new(handler))
            .unwrap();
        let dispatched = reactor
            .turn(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn unregister_all_empties_the_table() {
        let (a, _pa) = idle_pair();
        let (b, _pb) = idle_pair();
        let mut reactor = Reactor::new();
        reactor.register(Interest::READABLE, Box::new(a)).unwrap();
        reactor.register(Interest::READABLE, Box::new(b)).unwrap();
        assert_eq!(reactor.len(), 2);
        reactor.unregister_all();
        assert!(reactor.is_empty());
    }
}
