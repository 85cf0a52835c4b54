//! Shared test fixtures: a server wired to recording hooks, wake-channel
//! pairs and helpers to drain them.

use std::cell::{Cell, RefCell};
use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use persona_protocol::{Affinity, ClientPtr, Ptid, Status, WakeUpReply};

use crate::channel::StreamWakeChannel;
use crate::hooks::{DebugEvent, HostHooks, KickSignal, SelectorEntry};
use crate::object::SyncObject;
use crate::server::{Server, ServerConfig};
use crate::thread::Thread;

/// Hooks that record every collaborator interaction.
pub(crate) struct RecordingHooks {
    pub signals: RefCell<Vec<(Ptid, KickSignal)>>,
    pub signal_result: Cell<bool>,
    pub debug_events: RefCell<Vec<(Ptid, DebugEvent)>>,
    pub async_results: RefCell<Vec<(Status, u32, ClientPtr)>>,
    pub os_affinity: Cell<Affinity>,
    pub init_info_size: Cell<u32>,
}

impl RecordingHooks {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            signals: RefCell::new(Vec::new()),
            signal_result: Cell::new(true),
            debug_events: RefCell::new(Vec::new()),
            async_results: RefCell::new(Vec::new()),
            os_affinity: Cell::new(!0),
            init_info_size: Cell::new(0x600),
        })
    }
}

struct SharedHooks(Rc<RecordingHooks>);

impl HostHooks for SharedHooks {
    fn send_thread_signal(&self, thread: &Thread, signal: KickSignal) -> bool {
        self.0.signals.borrow_mut().push((thread.id(), signal));
        self.0.signal_result.get()
    }

    fn generate_debug_event(&self, thread: &Thread, event: DebugEvent) {
        self.0.debug_events.borrow_mut().push((thread.id(), event));
    }

    fn async_set_result(
        &self,
        _owner: &Rc<dyn SyncObject>,
        status: Status,
        total: u32,
        apc: ClientPtr,
    ) {
        self.0.async_results.borrow_mut().push((status, total, apc));
    }

    fn init_process(&self, _first_thread: &Rc<Thread>) -> u32 {
        self.0.init_info_size.get()
    }

    fn get_os_affinity(&self, _thread: &Thread) -> Option<Affinity> {
        Some(self.0.os_affinity.get())
    }

    fn get_selector_entry(
        &self,
        _thread: &Thread,
        entry: u32,
    ) -> persona_protocol::status::SvcResult<SelectorEntry> {
        Ok(SelectorEntry { base: entry * 0x1000, limit: 0xFFF, flags: 0x40 })
    }
}

/// A server with recording hooks and a handle to inspect them.
pub(crate) fn test_server() -> (Server, Rc<RecordingHooks>) {
    let hooks = RecordingHooks::new();
    let srv = Server::new(ServerConfig::default(), Box::new(SharedHooks(hooks.clone())));
    srv.set_time(1_000);
    (srv, hooks)
}

/// A wake channel and the client stream its records land on.
pub(crate) fn wake_pair() -> (StreamWakeChannel, UnixStream) {
    match StreamWakeChannel::pair() {
        Ok(pair) => pair,
        Err(err) => panic!("wake pair: {err}"),
    }
}

/// Drain every wake-up record currently buffered on `client`.
pub(crate) fn read_wakeups(client: &UnixStream) -> Vec<WakeUpReply> {
    client.set_nonblocking(true).unwrap();
    let mut replies = Vec::new();
    let mut stream = client;
    loop {
        let mut buf = [0u8; WakeUpReply::WIRE_SIZE];
        match stream.read_exact(&mut buf) {
            Ok(()) => replies.push(WakeUpReply::from_bytes(&buf)),
            Err(_) => break,
        }
    }
    replies
}

/// An owned descriptor plus a peer that keeps the pair alive.
pub(crate) fn pipe_fd_pair() -> (OwnedFd, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    (OwnedFd::from(a), b)
}
