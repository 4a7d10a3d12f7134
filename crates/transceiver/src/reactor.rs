//! The single cooperative event loop that owns every raw socket.
//!
//! Exactly one OS thread — the loop thread — ever touches a `mio` socket.
//! Every other thread talks to it by pushing a boxed closure (a [`Job`]) onto
//! a lock-free channel and waking the poller with a [`mio::Waker`]; the loop
//! drains pending jobs between blocking on I/O readiness, in the same spirit
//! as the mutex-and-condvar task queue this design replaces, but without a
//! lock on the hot path.

use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Waker};
use tracing::{event, Level};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::port::tcp_connection::TcpConnectionState;
use crate::port::tcp_listener::TcpListenerState;
use crate::port::udp_receiver::UdpReceiverState;
use crate::port::udp_sender::UdpSenderState;
use crate::port::{Port, PortId};
use crate::util::slab_rc::{SlabKey, SlabRc};

/// A unit of work submitted from outside the loop thread. Runs with
/// exclusive access to the [`Reactor`], so it may freely register/deregister
/// sockets or mutate port state.
pub(crate) type Job = Box<dyn FnOnce(&mut Reactor) + Send>;

const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// The cross-thread face of the event loop: anything that needs to reach the
/// loop thread (adding a port, writing to a connection, closing something)
/// goes through this handle.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    jobs: crossbeam::channel::Sender<Job>,
    waker: Arc<Waker>,
}

impl LoopHandle {
    /// Queues `job` for the loop thread and wakes it. Returns
    /// [`Error::LoopGone`] if the loop thread has already exited.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        self.jobs.send(job).map_err(|_| Error::LoopGone)?;
        self.waker.wake().map_err(Error::Io)?;
        Ok(())
    }
}

/// The concrete state backing one registered port, dispatched on by kind
/// when a readiness event for its token arrives.
pub(crate) enum PortSlot {
    UdpReceiver(UdpReceiverState),
    UdpSender(UdpSenderState),
    TcpListener(TcpListenerState),
    TcpConnection(TcpConnectionState),
}

/// Owns the poller, the port slab, and the pending job queue. The port slab
/// holds `Rc`s internally, which makes `Reactor` itself `!Send` — it is
/// built by [`ReactorInit::into_reactor`] directly on the thread that will
/// run it, rather than constructed elsewhere and handed off. Everything that
/// needs to reach it from another thread goes through a cloned
/// [`LoopHandle`] instead.
pub(crate) struct Reactor {
    pub(crate) poll: Poll,
    pub(crate) ports: SlabRc<PortSlot>,
    jobs: crossbeam::channel::Receiver<Job>,
    config: Config,
    self_handle: LoopHandle,
}

/// The `Send` pieces of a [`Reactor`], assembled on whichever thread calls
/// [`ReactorInit::new`] and then carried across into the loop thread, where
/// [`ReactorInit::into_reactor`] adds the (non-`Send`) port slab and becomes
/// the real `Reactor`.
pub(crate) struct ReactorInit {
    poll: Poll,
    jobs: crossbeam::channel::Receiver<Job>,
    config: Config,
    self_handle: LoopHandle,
}

impl ReactorInit {
    /// Creates the poller, job queue and waker, and a handle that can reach
    /// the reactor from other threads. Call [`ReactorInit::into_reactor`] on
    /// the thread that should own the reactor to finish construction.
    pub(crate) fn new(config: Config) -> Result<(Self, LoopHandle)> {
        let poll = Poll::new().map_err(Error::LoopInit)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(Error::LoopInit)?);
        let (jobs_tx, jobs_rx) = crossbeam::channel::unbounded();

        let handle = LoopHandle {
            jobs: jobs_tx,
            waker,
        };
        let init = Self {
            poll,
            jobs: jobs_rx,
            config,
            self_handle: handle.clone(),
        };

        Ok((init, handle))
    }

    pub(crate) fn into_reactor(self) -> Reactor {
        Reactor {
            poll: self.poll,
            ports: SlabRc::new(),
            jobs: self.jobs,
            config: self.config,
            self_handle: self.self_handle,
        }
    }
}

impl Reactor {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a clone of the handle other threads use to reach this
    /// reactor. Used when the reactor itself needs to hand out a port handle
    /// (e.g. for a freshly accepted TCP connection).
    pub(crate) fn loop_handle(&self) -> LoopHandle {
        self.self_handle.clone()
    }

    /// Registers a freshly inserted port's token with the poller. Call after
    /// inserting into `self.ports` so the `SlabKey` index is stable.
    pub(crate) fn reregister_readable_writable(
        &mut self,
        source: &mut impl mio::event::Source,
        id: PortId,
    ) -> Result<()> {
        self.poll
            .registry()
            .register(source, id.token(), mio::Interest::READABLE | mio::Interest::WRITABLE)
            .map_err(Error::Io)
    }

    pub(crate) fn register_readable(
        &mut self,
        source: &mut impl mio::event::Source,
        id: PortId,
    ) -> Result<()> {
        self.poll
            .registry()
            .register(source, id.token(), mio::Interest::READABLE)
            .map_err(Error::Io)
    }

    pub(crate) fn deregister(&mut self, source: &mut impl mio::event::Source) {
        let _ = self.poll.registry().deregister(source);
    }

    /// Runs the loop until `should_stop` reports true. Blocks, waking only
    /// when a job is submitted or a registered socket becomes ready.
    pub(crate) fn run(&mut self, should_stop: impl Fn() -> bool) {
        let mut events = Events::with_capacity(256);

        loop {
            if should_stop() {
                return;
            }

            if let Err(err) = self.poll.poll(&mut events, Some(Duration::from_millis(250))) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                event!(Level::ERROR, error = %err, "poll failed");
                continue;
            }

            for mio_event in events.iter() {
                if mio_event.token() == WAKE_TOKEN {
                    self.drain_jobs();
                    continue;
                }

                self.dispatch(mio_event);
            }
        }
    }

    fn drain_jobs(&mut self) {
        while let Ok(job) = self.jobs.try_recv() {
            job(self);
        }
    }

    fn dispatch(&mut self, mio_event: &mio::event::Event) {
        let index = mio_event.token().0;
        let Some((key, slot)) = self.ports.get_by_index(index) else {
            return;
        };

        let id = PortId::from_slab_key(key);
        let readable = mio_event.is_readable();
        let writable = mio_event.is_writable();

        // Each port kind owns its own borrow of `slot`; dispatch never needs
        // `self.ports` again while handling a single event, so the RefCell
        // borrow can't conflict with a job queued from inside the handler.
        let closed_itself = {
            let mut slot = slot.borrow_mut();
            match &mut *slot {
                PortSlot::UdpReceiver(state) => {
                    if readable {
                        state.on_readable(id);
                    }
                    false
                }
                PortSlot::UdpSender(state) => {
                    if writable {
                        state.on_writable(id);
                    }
                    false
                }
                PortSlot::TcpListener(state) => {
                    if readable {
                        state.on_readable(self, id);
                    }
                    false
                }
                PortSlot::TcpConnection(state) => {
                    if readable {
                        state.on_readable(id);
                    }
                    if writable {
                        state.on_writable(id);
                    }
                    // A peer hangup or a fatal stream error settles the
                    // connection here, on its own readiness event, with
                    // nobody waiting on a `remove_port` call to evict it —
                    // unlike every other close path, which is always driven
                    // by an explicit removal.
                    !state.is_open()
                }
            }
        };

        if closed_itself {
            self.remove(key);
        }
    }

    pub(crate) fn remove(&mut self, key: SlabKey) -> Option<std::rc::Rc<std::cell::RefCell<PortSlot>>> {
        self.ports.remove(key)
    }
}

/// Submits `job` and blocks on its `oneshot` reply, translating a dead loop
/// thread or a dropped sender into [`Error::LoopGone`]. Shared by every
/// public operation that needs to run something on the loop thread and wait
/// for its outcome.
pub(crate) fn call<T: Send + 'static>(
    handle: &LoopHandle,
    job: impl FnOnce(&mut Reactor, oneshot::Sender<Result<T>>) + Send + 'static,
) -> Result<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle.submit(Box::new(move |reactor| job(reactor, reply_tx)))?;
    reply_rx.recv().map_err(|_| Error::LoopGone)?
}
