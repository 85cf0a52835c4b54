//! Request entrypoints.
//!
//! One handler per request opcode, mirroring the wire protocol the
//! dispatcher speaks: a request record in, a reply record out.
//! Marshalling is the dispatcher's concern; handlers receive decoded
//! structs and the current thread, mutate core state and return a
//! reply or the status the dispatcher encodes into the reply's error
//! slot. Deferred outcomes (`PENDING`, `USER_APC`) are statuses, not
//! hard errors; `select` and the context queries carry them inside the
//! reply.

use std::rc::Rc;

use persona_protocol::consts::SERVER_PROTOCOL_VERSION;
use persona_protocol::context::system_regs;
use persona_protocol::status::SvcResult;
use persona_protocol::{
    Abstime, AccessMask, Affinity, ApcCall, ApcKind, ApcResult, ClientPtr, Context, ContextFlags,
    CpuMask, CpuType, Handle, Ptid, SelectFlags, Status, ThreadInfoMask,
};

use crate::apc::{queue_apc, thread_dequeue_apc, Apc};
use crate::channel::StreamWakeChannel;
use crate::handle::get_handle_obj;
use crate::hooks::DebugEvent;
use crate::process::Process;
use crate::server::Server;
use crate::thread::{
    self, create_thread, get_thread_from_handle, kill_thread, resume_thread,
    set_thread_affinity, stop_thread_if_suspended, suspend_thread, thread_get_inflight_fd,
    Thread, ThreadState,
};
use crate::token::Token;
use crate::wait::{select_on, wake_up};

/// Check that a client address can hold a client-side structure.
#[inline]
fn is_valid_address(addr: ClientPtr) -> bool {
    addr != 0 && addr % 4 == 0
}

// -- new_thread

/// `new_thread` request.
pub struct NewThreadRequest {
    /// In-flight index of the new thread's request channel.
    pub request_fd: i32,
    /// Access requested on the returned handle.
    pub access: AccessMask,
    /// Handle attributes (inheritance), recorded but not interpreted.
    pub attributes: u32,
    /// Create the thread suspended.
    pub suspend: bool,
}

/// `new_thread` reply.
#[derive(Debug)]
pub struct NewThreadReply {
    /// Id of the new thread.
    pub tid: Ptid,
    /// Handle to the new thread in the caller's process.
    pub handle: Handle,
}

/// Create a new thread in the caller's process.
pub fn handle_new_thread(
    srv: &Server,
    current: &Rc<Thread>,
    req: &NewThreadRequest,
) -> SvcResult<NewThreadReply> {
    let request_fd =
        thread_get_inflight_fd(srv, current, req.request_fd).ok_or(Status::INVALID_HANDLE)?;
    let thread = create_thread(srv, Some(request_fd), current.process())?;
    if req.suspend {
        thread.suspend.set(thread.suspend.get() + 1);
    }
    let handle = current.process().handles().alloc(thread.clone(), req.access);
    Ok(NewThreadReply { tid: thread.id(), handle })
}

// -- init_thread

/// `init_thread` request.
pub struct InitThreadRequest {
    /// In-flight index of the reply channel.
    pub reply_fd: i32,
    /// In-flight index of the wake channel.
    pub wait_fd: i32,
    /// OS process id of the client.
    pub unix_pid: i32,
    /// OS thread id of the client.
    pub unix_tid: i32,
    /// Client TEB address; must be non-zero and word-aligned.
    pub teb: ClientPtr,
    /// Client entry point (the process PEB for the first thread).
    pub entry: ClientPtr,
    /// Raw CPU tag of the client.
    pub cpu: u32,
    /// Client-requested debug level.
    pub debug_level: u32,
}

/// `init_thread` reply.
#[derive(Debug)]
pub struct InitThreadReply {
    /// Owning process id.
    pub pid: Ptid,
    /// This thread's id.
    pub tid: Ptid,
    /// Server protocol version.
    pub version: u32,
    /// Server start timestamp.
    pub server_start: Abstime,
    /// CPU types clients may request.
    pub all_cpus: CpuMask,
    /// Startup-info size, non-zero only for the first thread.
    pub info_size: u32,
}

/// Bind the current thread to its client-side identity. One-shot,
/// guarded by the absence of a reply channel. The first thread of a
/// process also finalises the process CPU type and affinity.
pub fn handle_init_thread(
    srv: &Server,
    current: &Rc<Thread>,
    req: &InitThreadRequest,
) -> SvcResult<InitThreadReply> {
    let prefix = srv.config().prefix_cpu_mask;
    let process = current.process().clone();

    let reply_fd = thread_get_inflight_fd(srv, current, req.reply_fd)
        .ok_or(Status::TOO_MANY_OPENED_FILES)?;
    let wait_fd = thread_get_inflight_fd(srv, current, req.wait_fd)
        .ok_or(Status::TOO_MANY_OPENED_FILES)?;

    if current.is_initialised() {
        return Err(Status::INVALID_PARAMETER);
    }
    *current.reply_channel.borrow_mut() = Some(reply_fd);
    current.set_wake_channel(Box::new(StreamWakeChannel::from_fd(wait_fd)));

    if !is_valid_address(req.teb) {
        return Err(Status::INVALID_PARAMETER);
    }

    current.unix_pid.set(Some(req.unix_pid));
    current.unix_tid.set(Some(req.unix_tid));
    current.teb.set(req.teb);
    srv.registry().index_unix_pid(req.unix_pid, current.id());

    let mut info_size = 0;
    if process.peb.get() == 0 {
        // First thread: finalise the process.
        let cpu = CpuType::from_raw(req.cpu)
            .filter(|cpu| srv.config().supported_cpus.supports(*cpu))
            .ok_or(Status::NOT_SUPPORTED)?;
        if !prefix.supports(cpu) {
            // The server supports it but the prefix does not.
            return Err(Status::NOT_REGISTRY_FILE);
        }
        process.unix_pid.set(Some(req.unix_pid));
        process.peb.set(req.entry);
        process.cpu.set(Some(cpu));
        info_size = srv.hooks().init_process(current);
        process.init_done.set(true);
        if process.has_parent {
            let _ = set_thread_affinity(srv, current, current.affinity());
        } else {
            let affinity = thread::get_thread_affinity(srv, current);
            process.affinity.set(affinity);
            current.affinity.set(affinity);
        }
    } else {
        if CpuType::from_raw(req.cpu) != process.cpu.get() {
            return Err(Status::INVALID_PARAMETER);
        }
        if process.unix_pid.get() != Some(req.unix_pid) {
            // Happens with thread libraries that give each thread its
            // own OS process.
            process.unix_pid.set(None);
        }
        stop_thread_if_suspended(srv, current);
        srv.hooks()
            .generate_debug_event(current, DebugEvent::CreateThread { entry: req.entry });
        let _ = set_thread_affinity(srv, current, current.affinity());
    }
    srv.raise_debug_level(req.debug_level);

    Ok(InitThreadReply {
        pid: process.id(),
        tid: current.id(),
        version: SERVER_PROTOCOL_VERSION,
        server_start: srv.start_time(),
        all_cpus: srv.config().supported_cpus.and(prefix),
        info_size,
    })
}

// -- terminate_thread

/// `terminate_thread` request.
pub struct TerminateThreadRequest {
    /// Thread handle with terminate access.
    pub handle: Handle,
    /// Exit code to record.
    pub exit_code: u32,
}

/// `terminate_thread` reply.
pub struct TerminateThreadReply {
    /// The caller asked to terminate itself; it is expected to exit its
    /// request loop rather than being killed mid-call.
    pub self_: bool,
    /// The caller was the last running thread of its process.
    pub last: bool,
}

/// Terminate a thread.
pub fn handle_terminate_thread(
    srv: &Server,
    current: &Rc<Thread>,
    req: &TerminateThreadRequest,
) -> SvcResult<TerminateThreadReply> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_TERMINATE)?;
    thread.exit_code.set(req.exit_code);
    if !Rc::ptr_eq(&thread, current) {
        kill_thread(srv, &thread, true);
        return Ok(TerminateThreadReply { self_: false, last: false });
    }
    Ok(TerminateThreadReply {
        self_: true,
        last: thread.process().running_threads() == 1,
    })
}

// -- open_thread

/// `open_thread` request.
pub struct OpenThreadRequest {
    /// Thread id to open.
    pub tid: Ptid,
    /// Requested access.
    pub access: AccessMask,
    /// Handle attributes.
    pub attributes: u32,
}

/// `open_thread` reply.
#[derive(Debug)]
pub struct OpenThreadReply {
    /// Handle to the thread.
    pub handle: Handle,
}

/// Open a handle to a thread by id.
pub fn handle_open_thread(
    srv: &Server,
    current: &Rc<Thread>,
    req: &OpenThreadRequest,
) -> SvcResult<OpenThreadReply> {
    let thread = srv.registry().get_thread_from_id(req.tid)?;
    let handle = current.process().handles().alloc(thread, req.access);
    Ok(OpenThreadReply { handle })
}

// -- get_thread_info

/// `get_thread_info` request.
pub struct GetThreadInfoRequest {
    /// Thread handle; null to look up by `tid_in`.
    pub handle: Handle,
    /// Thread id used when `handle` is null.
    pub tid_in: Ptid,
}

/// `get_thread_info` reply.
pub struct GetThreadInfoReply {
    /// Owning process id.
    pub pid: Ptid,
    /// Thread id.
    pub tid: Ptid,
    /// Client TEB address.
    pub teb: ClientPtr,
    /// Exit code, `PENDING` while the thread runs.
    pub exit_code: u32,
    /// Scheduling priority.
    pub priority: i32,
    /// Affinity mask.
    pub affinity: Affinity,
    /// Creation timestamp.
    pub creation_time: Abstime,
    /// Exit timestamp, zero while running.
    pub exit_time: Abstime,
    /// The thread is the last running one of its process.
    pub last: bool,
}

/// Fetch information about a thread.
pub fn handle_get_thread_info(
    srv: &Server,
    current: &Rc<Thread>,
    req: &GetThreadInfoRequest,
) -> SvcResult<GetThreadInfoReply> {
    let thread = if req.handle.is_null() {
        srv.registry().get_thread_from_id(req.tid_in)?
    } else {
        get_thread_from_handle(current, req.handle, AccessMask::THREAD_QUERY_INFORMATION)?
    };
    Ok(GetThreadInfoReply {
        pid: thread.process().id(),
        tid: thread.id(),
        teb: thread.teb(),
        exit_code: if thread.is_terminated() {
            thread.exit_code()
        } else {
            Status::PENDING.raw()
        },
        priority: thread.priority(),
        affinity: thread.affinity(),
        creation_time: thread.creation_time(),
        exit_time: thread.exit_time(),
        last: thread.process().running_threads() == 1,
    })
}

// -- set_thread_info

/// `set_thread_info` request.
pub struct SetThreadInfoRequest {
    /// Thread handle with set-information access.
    pub handle: Handle,
    /// Fields to update.
    pub mask: ThreadInfoMask,
    /// New priority, when selected.
    pub priority: i32,
    /// New affinity, when selected.
    pub affinity: Affinity,
    /// Token handle, when selected; null detaches the token.
    pub token: Handle,
}

/// Update scheduling attributes or the impersonation token.
///
/// Every selected field is processed; the status of the last failing
/// one is reported.
pub fn handle_set_thread_info(
    srv: &Server,
    current: &Rc<Thread>,
    req: &SetThreadInfoRequest,
) -> SvcResult<()> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SET_INFORMATION)?;
    let mut result = Ok(());

    if req.mask.has(ThreadInfoMask::PRIORITY) {
        if thread.process().priority_class().allows_priority(req.priority) {
            thread.priority.set(req.priority);
        } else {
            result = Err(Status::INVALID_PARAMETER);
        }
    }
    if req.mask.has(ThreadInfoMask::AFFINITY) {
        let process_mask = thread.process().affinity();
        if req.affinity == 0 || (req.affinity & process_mask) != req.affinity {
            result = Err(Status::INVALID_PARAMETER);
        } else if thread.state() == ThreadState::Terminated {
            result = Err(Status::THREAD_IS_TERMINATING);
        } else if set_thread_affinity(srv, &thread, req.affinity).is_err() {
            result = Err(Status::UNSUCCESSFUL);
        }
    }
    if req.mask.has(ThreadInfoMask::TOKEN) {
        if req.token.is_null() {
            *thread.token.borrow_mut() = None;
        } else {
            match get_handle_obj::<Token>(current.process().handles(), req.token, AccessMask::NONE)
            {
                Ok(token) => *thread.token.borrow_mut() = Some(token),
                Err(status) => result = Err(status),
            }
        }
    }
    result
}

// -- suspend_thread / resume_thread

/// `suspend_thread` and `resume_thread` request.
pub struct SuspendThreadRequest {
    /// Thread handle with suspend-resume access.
    pub handle: Handle,
}

/// `suspend_thread` and `resume_thread` reply.
#[derive(Debug)]
pub struct SuspendThreadReply {
    /// Suspend counter before the operation.
    pub count: i32,
}

/// Increment a thread's suspend counter.
pub fn handle_suspend_thread(
    srv: &Server,
    current: &Rc<Thread>,
    req: &SuspendThreadRequest,
) -> SvcResult<SuspendThreadReply> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SUSPEND_RESUME)?;
    if thread.is_terminated() {
        return Err(Status::ACCESS_DENIED);
    }
    let count = suspend_thread(srv, &thread)?;
    Ok(SuspendThreadReply { count })
}

/// Decrement a thread's suspend counter.
pub fn handle_resume_thread(
    srv: &Server,
    current: &Rc<Thread>,
    req: &SuspendThreadRequest,
) -> SvcResult<SuspendThreadReply> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SUSPEND_RESUME)?;
    Ok(SuspendThreadReply { count: resume_thread(srv, &thread) })
}

// -- select

/// `select` request.
pub struct SelectRequest {
    /// Cookie echoed in the wake-up record.
    pub cookie: ClientPtr,
    /// Wait flags.
    pub flags: SelectFlags,
    /// Deadline; non-positive values are deltas from now.
    pub timeout: Abstime,
    /// Object to signal before waiting (signal-and-wait); null for none.
    pub signal: Handle,
    /// Handle of the previously delivered APC; null for none.
    pub prev_apc: Handle,
    /// Result of the previous APC.
    pub result: ApcResult,
    /// Objects to wait on.
    pub handles: Vec<Handle>,
}

/// `select` reply.
pub struct SelectReply {
    /// Absolute deadline the wait was installed with.
    pub timeout: Abstime,
    /// Immediate verdict: `PENDING` when the client must block on its
    /// wake channel, otherwise the wake status.
    pub status: Status,
    /// Handle of the APC handed to the client, when `status` is
    /// `USER_APC` and a call is pending.
    pub apc_handle: Handle,
    /// The call to execute.
    pub call: Option<ApcCall>,
}

/// Install a wait, posting the previous APC's result first and handing
/// out the next APC when one terminates the wait.
pub fn handle_select(
    srv: &Server,
    current: &Rc<Thread>,
    req: &SelectRequest,
) -> SvcResult<SelectReply> {
    if !req.prev_apc.is_null() {
        let apc = get_handle_obj::<Apc>(current.process().handles(), req.prev_apc, AccessMask::NONE)?;
        apc.set_result(req.result.clone());
        apc.set_executed();
        match apc.result() {
            ApcResult::CreateThread { status, tid, handle } if !handle.is_null() => {
                // The handle names the new thread in the executing
                // process; move it to the original caller. Best effort,
                // errors are swallowed.
                let transferred = apc
                    .caller()
                    .map(|caller| {
                        current
                            .process()
                            .handles()
                            .duplicate_same_access(handle, caller.process().handles())
                            .unwrap_or(Handle::NULL)
                    })
                    .unwrap_or(Handle::NULL);
                let _ = current.process().handles().close(handle);
                apc.set_result(ApcResult::CreateThread { status, tid, handle: transferred });
            }
            ApcResult::AsyncIo { status, total, apc: chained } => {
                if let Some(owner) = apc.owner() {
                    srv.hooks().async_set_result(owner, status, total, chained);
                }
            }
            _ => {}
        }
        wake_up(srv, apc.as_ref(), 0);
        let _ = current.process().handles().close(req.prev_apc);
    }

    let (deadline, status) = select_on(
        srv,
        current,
        &req.handles,
        req.flags,
        req.timeout,
        req.signal,
        req.cookie,
    )?;

    let mut reply = SelectReply { timeout: deadline, status, apc_handle: Handle::NULL, call: None };
    if status == Status::USER_APC {
        while let Some(apc) = thread_dequeue_apc(current, !req.flags.alertable()) {
            if apc.call().kind() != ApcKind::None {
                reply.apc_handle =
                    current.process().handles().alloc(apc.clone(), AccessMask::SYNCHRONIZE);
                reply.call = Some(apc.call().clone());
                break;
            }
            // Wake-only calls are discarded; the thread is awake now.
            apc.mark_executed(srv);
        }
    }
    Ok(reply)
}

// -- queue_apc

/// `queue_apc` request.
pub struct QueueApcRequest {
    /// Thread or process handle, depending on the call kind.
    pub handle: Handle,
    /// The call to queue.
    pub call: ApcCall,
}

/// `queue_apc` reply.
#[derive(Debug)]
pub struct QueueApcReply {
    /// The APC targets the caller's own thread or process; the caller
    /// executes it directly.
    pub self_: bool,
    /// Handle to await the APC result, for cross-process system APCs.
    pub handle: Handle,
}

/// Queue an APC on a thread or a process.
pub fn handle_queue_apc(
    srv: &Server,
    current: &Rc<Thread>,
    req: &QueueApcRequest,
) -> SvcResult<QueueApcReply> {
    match req.call.kind() {
        ApcKind::None | ApcKind::User => {
            let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SET_CONTEXT)?;
            let apc = Apc::create(None, req.call.clone());
            if !queue_apc(srv, None, Some(&thread), &apc) {
                return Err(Status::THREAD_IS_TERMINATING);
            }
            Ok(QueueApcReply { self_: Rc::ptr_eq(&thread, current), handle: Handle::NULL })
        }
        ApcKind::VirtualAlloc
        | ApcKind::VirtualFree
        | ApcKind::VirtualProtect
        | ApcKind::VirtualFlush
        | ApcKind::VirtualLock
        | ApcKind::VirtualUnlock
        | ApcKind::UnmapView => {
            let process = get_process_from_handle(current, req.handle, AccessMask::PROCESS_VM_OPERATION)?;
            queue_process_apc(srv, current, &process, req.call.clone())
        }
        ApcKind::VirtualQuery => {
            let process =
                get_process_from_handle(current, req.handle, AccessMask::PROCESS_QUERY_INFORMATION)?;
            queue_process_apc(srv, current, &process, req.call.clone())
        }
        ApcKind::MapView => {
            let process = get_process_from_handle(current, req.handle, AccessMask::PROCESS_VM_OPERATION)?;
            let mut call = req.call.clone();
            if let ApcCall::MapView { handle, .. } = &mut call {
                if !Rc::ptr_eq(&process, current.process()) {
                    // The section handle must be valid in the target.
                    *handle = current
                        .process()
                        .handles()
                        .duplicate_same_access(*handle, process.handles())?;
                }
            }
            queue_process_apc(srv, current, &process, call)
        }
        ApcKind::CreateThread => {
            let process = get_process_from_handle(current, req.handle, AccessMask::PROCESS_CREATE_THREAD)?;
            queue_process_apc(srv, current, &process, req.call.clone())
        }
        ApcKind::Timer | ApcKind::AsyncIo => Err(Status::INVALID_PARAMETER),
    }
}

fn get_process_from_handle(
    current: &Rc<Thread>,
    handle: Handle,
    access: AccessMask,
) -> SvcResult<Rc<Process>> {
    get_handle_obj::<Process>(current.process().handles(), handle, access)
}

fn queue_process_apc(
    srv: &Server,
    current: &Rc<Thread>,
    process: &Rc<Process>,
    call: ApcCall,
) -> SvcResult<QueueApcReply> {
    if Rc::ptr_eq(process, current.process()) {
        return Ok(QueueApcReply { self_: true, handle: Handle::NULL });
    }
    let apc = Apc::create(None, call);
    let handle = current.process().handles().alloc(apc.clone(), AccessMask::SYNCHRONIZE);
    if queue_apc(srv, Some(process), None, &apc) {
        apc.set_caller(current.clone());
        Ok(QueueApcReply { self_: false, handle })
    } else {
        let _ = current.process().handles().close(handle);
        Err(Status::PROCESS_IS_TERMINATING)
    }
}

// -- get_apc_result

/// `get_apc_result` request.
pub struct GetApcResultRequest {
    /// APC handle returned by `queue_apc`.
    pub handle: Handle,
}

/// `get_apc_result` reply.
#[derive(Debug)]
pub struct GetApcResultReply {
    /// The posted result.
    pub result: ApcResult,
}

/// Fetch the result of a queued APC; `PENDING` until the client
/// executes it. On success the handle is closed to save a round-trip.
pub fn handle_get_apc_result(
    _srv: &Server,
    current: &Rc<Thread>,
    req: &GetApcResultRequest,
) -> SvcResult<GetApcResultReply> {
    let apc = get_handle_obj::<Apc>(current.process().handles(), req.handle, AccessMask::NONE)?;
    if !apc.executed() {
        return Err(Status::PENDING);
    }
    let result = apc.result();
    let _ = current.process().handles().close(req.handle);
    Ok(GetApcResultReply { result })
}

// -- get_thread_context / set_thread_context

/// `get_thread_context` request.
pub struct GetThreadContextRequest {
    /// Thread handle with get-context access.
    pub handle: Handle,
    /// Register banks wanted.
    pub flags: ContextFlags,
    /// Suspend the target when it is not captured yet, then retry.
    pub suspend: bool,
}

/// `get_thread_context` reply.
pub struct GetThreadContextReply {
    /// Target is the calling thread.
    pub self_: bool,
    /// `SUCCESS`, `PENDING` (retry after capture) or `UNSUCCESSFUL`.
    pub status: Status,
    /// The context, on success.
    pub context: Option<Context>,
}

/// Read the register context of a captured thread.
pub fn handle_get_thread_context(
    srv: &Server,
    current: &Rc<Thread>,
    req: &GetThreadContextRequest,
) -> SvcResult<GetThreadContextReply> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_GET_CONTEXT)?;
    let self_ = Rc::ptr_eq(&thread, current);

    if !self_ && thread.captured().is_none() {
        if thread.state() != ThreadState::Running {
            return Ok(GetThreadContextReply { self_, status: Status::UNSUCCESSFUL, context: None });
        }
        if req.suspend {
            let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SUSPEND_RESUME)?;
            let _ = suspend_thread(srv, &thread);
        }
        return Ok(GetThreadContextReply { self_, status: Status::PENDING, context: None });
    }

    let cpu = thread.process().cpu().ok_or(Status::UNSUCCESSFUL)?;
    let system = system_regs(cpu);
    let mut context = Context::new(cpu);
    if let Some(captured) = thread.captured() {
        context.copy_from(&captured.borrow(), req.flags.minus(system));
    }
    if !system.is_empty() {
        srv.hooks().read_system_regs(&thread, &mut context, system)?;
    }
    Ok(GetThreadContextReply { self_, status: Status::SUCCESS, context: Some(context) })
}

/// `set_thread_context` request.
pub struct SetThreadContextRequest {
    /// Thread handle with set-context access.
    pub handle: Handle,
    /// The context to merge; its `flags` select the banks written.
    pub context: Context,
    /// Suspend the target when it is not captured yet, then retry.
    pub suspend: bool,
}

/// `set_thread_context` reply.
pub struct SetThreadContextReply {
    /// Target is the calling thread.
    pub self_: bool,
    /// `SUCCESS`, `PENDING` or `UNSUCCESSFUL`.
    pub status: Status,
}

/// Write the register context of a captured thread. System registers
/// go through the per-CPU hook; client banks merge into the captured
/// context in place.
pub fn handle_set_thread_context(
    srv: &Server,
    current: &Rc<Thread>,
    req: &SetThreadContextRequest,
) -> SvcResult<SetThreadContextReply> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SET_CONTEXT)?;
    let self_ = Rc::ptr_eq(&thread, current);

    if !self_ && thread.captured().is_none() {
        if thread.state() != ThreadState::Running {
            return Ok(SetThreadContextReply { self_, status: Status::UNSUCCESSFUL });
        }
        if req.suspend {
            let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_SUSPEND_RESUME)?;
            let _ = suspend_thread(srv, &thread);
        }
        return Ok(SetThreadContextReply { self_, status: Status::PENDING });
    }

    if thread.process().cpu() != Some(req.context.cpu) {
        return Err(Status::INVALID_PARAMETER);
    }
    let system = system_regs(req.context.cpu).and(req.context.flags);
    let client = req.context.flags.minus(system);
    if !system.is_empty() {
        srv.hooks().write_system_regs(&thread, &req.context, system)?;
    }
    if let Some(captured) = thread.captured() {
        captured.borrow_mut().copy_from(&req.context, client);
    }
    Ok(SetThreadContextReply { self_, status: Status::SUCCESS })
}

// -- get_suspend_context / set_suspend_context

/// `get_suspend_context` reply.
#[derive(Debug)]
pub struct GetSuspendContextReply {
    /// The captured context, handed off; the slot is cleared.
    pub context: Context,
}

/// Retrieve the suspend-time context of the calling thread. One-shot:
/// the stored pointer is handed off and the slot nulled.
pub fn handle_get_suspend_context(
    srv: &Server,
    current: &Rc<Thread>,
) -> SvcResult<GetSuspendContextReply> {
    let taken = current.suspend_context.borrow_mut().take();
    let Some(stored) = taken else {
        // Not suspended; the client should never ask.
        return Err(Status::INVALID_PARAMETER);
    };
    let aliased = current
        .captured
        .borrow()
        .as_ref()
        .is_some_and(|captured| Rc::ptr_eq(captured, &stored));
    if aliased {
        *current.captured.borrow_mut() = None;
        stop_thread_if_suspended(srv, current);
    }
    let context = stored.borrow().clone();
    Ok(GetSuspendContextReply { context })
}

/// `set_suspend_context` request.
pub struct SetSuspendContextRequest {
    /// The context captured by the stopped client thread.
    pub context: Context,
}

/// Store the context a suspended client thread delivered. Nested
/// captures are rejected. A pending debug break fires immediately on
/// the captured instruction pointer.
pub fn handle_set_suspend_context(
    srv: &Server,
    current: &Rc<Thread>,
    req: &SetSuspendContextRequest,
) -> SvcResult<()> {
    if current.captured.borrow().is_some()
        || current.process().cpu() != Some(req.context.cpu)
    {
        // Nested suspend or exception; should not happen.
        return Err(Status::INVALID_PARAMETER);
    }
    let stored = Rc::new(std::cell::RefCell::new(req.context.clone()));
    *current.suspend_context.borrow_mut() = Some(stored.clone());
    *current.captured.borrow_mut() = Some(stored);
    if current.debug_break.get() {
        thread::break_thread(srv, current);
    }
    Ok(())
}

// -- get_selector_entry

/// `get_selector_entry` request.
pub struct GetSelectorEntryRequest {
    /// Thread handle with query access.
    pub handle: Handle,
    /// Selector index.
    pub entry: u32,
}

/// `get_selector_entry` reply.
pub struct GetSelectorEntryReply {
    /// Segment base.
    pub base: u32,
    /// Segment limit.
    pub limit: u32,
    /// Descriptor flags.
    pub flags: u32,
}

/// Fetch a descriptor-table entry of a thread.
pub fn handle_get_selector_entry(
    srv: &Server,
    current: &Rc<Thread>,
    req: &GetSelectorEntryRequest,
) -> SvcResult<GetSelectorEntryReply> {
    let thread = get_thread_from_handle(current, req.handle, AccessMask::THREAD_QUERY_INFORMATION)?;
    let entry = srv.hooks().get_selector_entry(&thread, req.entry)?;
    Ok(GetSelectorEntryReply { base: entry.base, limit: entry.limit, flags: entry.flags })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::KickSignal;
    use crate::process::create_process;
    use crate::server::ServerConfig;
    use crate::sync::{Event, Mutex, Semaphore};
    use crate::testutil::{pipe_fd_pair, read_wakeups, test_server};
    use crate::thread::thread_add_inflight_fd as add_fd;
    use persona_protocol::TIMEOUT_INFINITE;
    use std::os::unix::net::UnixStream;

    fn supported_cpu(srv: &Server) -> CpuType {
        CpuType::ALL
            .into_iter()
            .find(|cpu| srv.config().supported_cpus.supports(*cpu))
            .unwrap()
    }

    fn seed_channel_fds(thread: &Thread) -> UnixStream {
        let (reply_fd, _reply_peer) = pipe_fd_pair();
        add_fd(thread, 10, reply_fd);
        let (wait_fd, wake_peer) = pipe_fd_pair();
        add_fd(thread, 11, wait_fd);
        wake_peer
    }

    fn init_request(srv: &Server) -> InitThreadRequest {
        InitThreadRequest {
            reply_fd: 10,
            wait_fd: 11,
            unix_pid: 501,
            unix_tid: 601,
            teb: 0x7ffd_0000,
            entry: 0x0040_1000,
            cpu: supported_cpu(srv) as u32,
            debug_level: 0,
        }
    }

    /// A fully initialised client thread plus the stream its wake
    /// records land on.
    fn init_client(srv: &Server) -> (Rc<crate::process::Process>, Rc<Thread>, UnixStream) {
        let process = create_process(srv, None).unwrap();
        let thread = create_thread(srv, None, &process).unwrap();
        let wake_peer = seed_channel_fds(&thread);
        handle_init_thread(srv, &thread, &init_request(srv)).unwrap();
        (process, thread, wake_peer)
    }

    #[test]
    fn test_init_thread_first_thread() {
        let (srv, hooks) = test_server();
        hooks.os_affinity.set(0x0F);
        let process = create_process(&srv, None).unwrap();
        let thread = create_thread(&srv, None, &process).unwrap();
        let _wake = seed_channel_fds(&thread);

        let reply = handle_init_thread(&srv, &thread, &init_request(&srv)).unwrap();
        assert_eq!(reply.pid, process.id());
        assert_eq!(reply.tid, thread.id());
        assert_eq!(reply.version, SERVER_PROTOCOL_VERSION);
        assert_eq!(reply.info_size, 0x600);
        assert!(!reply.all_cpus.is_empty());

        assert!(process.is_init_done());
        assert_eq!(process.cpu(), Some(supported_cpu(&srv)));
        // No parent: the OS affinity is adopted as the process mask.
        assert_eq!(process.affinity(), 0x0F);
        assert_eq!(thread.affinity(), 0x0F);
        assert_eq!(thread.unix_tid(), Some(601));
        assert!(Rc::ptr_eq(
            &srv.registry().get_thread_from_pid(501).unwrap(),
            &thread
        ));
    }

    #[test]
    fn test_init_thread_is_one_shot() {
        let (srv, _hooks) = test_server();
        let (_process, thread, _wake) = init_client(&srv);
        let _extra = seed_channel_fds(&thread);
        let err = handle_init_thread(&srv, &thread, &init_request(&srv)).unwrap_err();
        assert_eq!(err, Status::INVALID_PARAMETER);
    }

    #[test]
    fn test_init_thread_validates_teb() {
        let (srv, _hooks) = test_server();
        let process = create_process(&srv, None).unwrap();
        for teb in [0u64, 0x1001, 0x1002] {
            let thread = create_thread(&srv, None, &process).unwrap();
            let _wake = seed_channel_fds(&thread);
            let mut req = init_request(&srv);
            req.teb = teb;
            let err = handle_init_thread(&srv, &thread, &req).unwrap_err();
            assert_eq!(err, Status::INVALID_PARAMETER);
            kill_thread(&srv, &thread, false);
        }
    }

    #[test]
    fn test_init_thread_missing_inflight_fd() {
        let (srv, _hooks) = test_server();
        let process = create_process(&srv, None).unwrap();
        let thread = create_thread(&srv, None, &process).unwrap();
        let err = handle_init_thread(&srv, &thread, &init_request(&srv)).unwrap_err();
        assert_eq!(err, Status::TOO_MANY_OPENED_FILES);
    }

    #[test]
    fn test_init_thread_cpu_rejection() {
        use persona_protocol::CpuMask;
        let hooks = Box::new(crate::hooks::NullHooks);
        let srv = Server::new(
            ServerConfig {
                supported_cpus: CpuType::X86.flag(),
                prefix_cpu_mask: CpuMask::ALL,
                ..ServerConfig::default()
            },
            hooks,
        );
        let process = create_process(&srv, None).unwrap();
        let thread = create_thread(&srv, None, &process).unwrap();
        let _wake = seed_channel_fds(&thread);
        let mut req = init_request(&srv);
        req.cpu = CpuType::Arm64 as u32;
        assert_eq!(
            handle_init_thread(&srv, &thread, &req).unwrap_err(),
            Status::NOT_SUPPORTED
        );

        // Supported by the server but masked out by the prefix.
        let srv = Server::new(
            ServerConfig {
                supported_cpus: CpuType::X86.flag(),
                prefix_cpu_mask: CpuType::Arm64.flag(),
                ..ServerConfig::default()
            },
            Box::new(crate::hooks::NullHooks),
        );
        let process = create_process(&srv, None).unwrap();
        let thread = create_thread(&srv, None, &process).unwrap();
        let _wake = seed_channel_fds(&thread);
        let mut req = init_request(&srv);
        req.cpu = CpuType::X86 as u32;
        assert_eq!(
            handle_init_thread(&srv, &thread, &req).unwrap_err(),
            Status::NOT_REGISTRY_FILE
        );
    }

    #[test]
    fn test_second_thread_init() {
        let (srv, hooks) = test_server();
        let (process, _first, _wake) = init_client(&srv);

        let second = create_thread(&srv, None, &process).unwrap();
        let _wake2 = seed_channel_fds(&second);
        let mut req = init_request(&srv);
        req.unix_tid = 602;
        let reply = handle_init_thread(&srv, &second, &req).unwrap();
        assert_eq!(reply.info_size, 0);
        assert!(hooks
            .debug_events
            .borrow()
            .iter()
            .any(|(id, event)| *id == second.id()
                && matches!(event, DebugEvent::CreateThread { entry: 0x0040_1000 })));

        // A CPU mismatch on a later thread is rejected.
        let third = create_thread(&srv, None, &process).unwrap();
        let _wake3 = seed_channel_fds(&third);
        let mut req = init_request(&srv);
        req.cpu = 99;
        assert_eq!(
            handle_init_thread(&srv, &third, &req).unwrap_err(),
            Status::INVALID_PARAMETER
        );
    }

    #[test]
    fn test_new_thread() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);

        let (request_fd, _peer) = pipe_fd_pair();
        add_fd(&current, 5, request_fd);
        let reply = handle_new_thread(
            &srv,
            &current,
            &NewThreadRequest {
                request_fd: 5,
                access: AccessMask::GENERIC_ALL,
                attributes: 0,
                suspend: true,
            },
        )
        .unwrap();

        let thread = srv.registry().get_thread_from_id(reply.tid).unwrap();
        assert_eq!(thread.suspend_count(), 1);
        assert!(current
            .process()
            .handles()
            .get_access(reply.handle)
            .unwrap()
            .contains(AccessMask::THREAD_ALL_ACCESS));

        // Without an in-flight descriptor the request fails.
        let err = handle_new_thread(
            &srv,
            &current,
            &NewThreadRequest { request_fd: 6, access: AccessMask::NONE, attributes: 0, suspend: false },
        )
        .unwrap_err();
        assert_eq!(err, Status::INVALID_HANDLE);
    }

    #[test]
    fn test_terminate_thread_self_and_other() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        let other = create_thread(&srv, None, current.process()).unwrap();

        let other_handle = current
            .process()
            .handles()
            .alloc(other.clone(), AccessMask::THREAD_TERMINATE);
        let reply = handle_terminate_thread(
            &srv,
            &current,
            &TerminateThreadRequest { handle: other_handle, exit_code: 42 },
        )
        .unwrap();
        assert!(!reply.self_);
        assert!(other.is_terminated());
        assert_eq!(other.exit_code(), 42);

        let self_handle = current
            .process()
            .handles()
            .alloc(current.clone(), AccessMask::THREAD_TERMINATE);
        let reply = handle_terminate_thread(
            &srv,
            &current,
            &TerminateThreadRequest { handle: self_handle, exit_code: 7 },
        )
        .unwrap();
        // Self-termination reports instead of killing mid-call.
        assert!(reply.self_);
        assert!(reply.last);
        assert!(!current.is_terminated());
    }

    #[test]
    fn test_open_thread_and_invalid_cid() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);

        let reply = handle_open_thread(
            &srv,
            &current,
            &OpenThreadRequest {
                tid: current.id(),
                access: AccessMask::THREAD_QUERY_INFORMATION,
                attributes: 0,
            },
        )
        .unwrap();
        assert!(!reply.handle.is_null());

        let err = handle_open_thread(
            &srv,
            &current,
            &OpenThreadRequest { tid: 0xDEAD << 2, access: AccessMask::NONE, attributes: 0 },
        )
        .unwrap_err();
        assert_eq!(err, Status::INVALID_CID);
    }

    #[test]
    fn test_get_thread_info() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);

        let reply = handle_get_thread_info(
            &srv,
            &current,
            &GetThreadInfoRequest { handle: Handle::NULL, tid_in: current.id() },
        )
        .unwrap();
        assert_eq!(reply.tid, current.id());
        assert_eq!(reply.teb, 0x7ffd_0000);
        assert_eq!(reply.exit_code, Status::PENDING.raw());
        assert!(reply.last);

        kill_thread(&srv, &current, false);
        let reply = handle_get_thread_info(
            &srv,
            &current,
            &GetThreadInfoRequest { handle: Handle::NULL, tid_in: current.id() },
        )
        .unwrap();
        assert_eq!(reply.exit_code, 0);
        assert_eq!(reply.exit_time, srv.now());
    }

    #[test]
    fn test_set_thread_info_rules() {
        let (srv, _hooks) = test_server();
        let (process, current, _wake) = init_client(&srv);
        process.affinity.set(0b0111);
        current.affinity.set(0b0001);
        let handle = current
            .process()
            .handles()
            .alloc(current.clone(), AccessMask::THREAD_SET_INFORMATION);

        // Valid priority and affinity.
        handle_set_thread_info(
            &srv,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: ThreadInfoMask::PRIORITY | ThreadInfoMask::AFFINITY,
                priority: 2,
                affinity: 0b0110,
                token: Handle::NULL,
            },
        )
        .unwrap();
        assert_eq!(current.priority(), 2);
        assert_eq!(current.affinity(), 0b0110);

        // Out-of-class priority is rejected, sentinels are accepted.
        let err = handle_set_thread_info(
            &srv,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: ThreadInfoMask::PRIORITY,
                priority: 5,
                affinity: 0,
                token: Handle::NULL,
            },
        )
        .unwrap_err();
        assert_eq!(err, Status::INVALID_PARAMETER);
        handle_set_thread_info(
            &srv,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: ThreadInfoMask::PRIORITY,
                priority: persona_protocol::consts::THREAD_PRIORITY_TIME_CRITICAL,
                affinity: 0,
                token: Handle::NULL,
            },
        )
        .unwrap();

        // Affinity outside the process mask, or empty, is rejected.
        for affinity in [0b1000u64, 0] {
            let err = handle_set_thread_info(
                &srv,
                &current,
                &SetThreadInfoRequest {
                    handle,
                    mask: ThreadInfoMask::AFFINITY,
                    priority: 0,
                    affinity,
                    token: Handle::NULL,
                },
            )
            .unwrap_err();
            assert_eq!(err, Status::INVALID_PARAMETER);
        }

        // Token attach and detach.
        let token = Token::new();
        let token_handle = current.process().handles().alloc(token, AccessMask::NONE);
        handle_set_thread_info(
            &srv,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: ThreadInfoMask::TOKEN,
                priority: 0,
                affinity: 0,
                token: token_handle,
            },
        )
        .unwrap();
        assert!(thread::thread_get_impersonation_token(&current).is_some());
    }

    #[test]
    fn test_suspend_resume_handlers() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        let other = create_thread(&srv, None, current.process()).unwrap();
        let handle = current
            .process()
            .handles()
            .alloc(other.clone(), AccessMask::THREAD_SUSPEND_RESUME);

        let reply =
            handle_suspend_thread(&srv, &current, &SuspendThreadRequest { handle }).unwrap();
        assert_eq!(reply.count, 0);
        let reply =
            handle_resume_thread(&srv, &current, &SuspendThreadRequest { handle }).unwrap();
        assert_eq!(reply.count, 1);

        kill_thread(&srv, &other, false);
        let err =
            handle_suspend_thread(&srv, &current, &SuspendThreadRequest { handle }).unwrap_err();
        assert_eq!(err, Status::ACCESS_DENIED);
    }

    fn select_request(handles: Vec<Handle>, flags: SelectFlags, timeout: Abstime) -> SelectRequest {
        SelectRequest {
            cookie: 0x1234,
            flags,
            timeout,
            signal: Handle::NULL,
            prev_apc: Handle::NULL,
            result: ApcResult::None,
            handles,
        }
    }

    #[test]
    fn test_select_signal_and_wait_self_satisfies() {
        let (srv, _hooks) = test_server();
        let (_process, current, wake) = init_client(&srv);

        let sem = Semaphore::new(0, 1).unwrap();
        let handle = current.process().handles().alloc(
            sem.clone(),
            AccessMask::SYNCHRONIZE | AccessMask::SEMAPHORE_MODIFY_STATE,
        );

        let mut req = select_request(vec![handle], SelectFlags::NONE, TIMEOUT_INFINITE);
        req.signal = handle;
        let reply = handle_select(&srv, &current, &req).unwrap();

        // The wait is cancelled and the call answered directly: exactly
        // one delivery, nothing on the wake channel.
        assert_eq!(reply.status, Status::from_wait_index(0));
        assert!(read_wakeups(&wake).is_empty());
        // The released count was consumed by the wait.
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_select_signal_and_wait_reports_real_status() {
        let (srv, _hooks) = test_server();
        let (_process, current, wake) = init_client(&srv);

        // WAIT-ANY over two handles; the self-signal satisfies index 1.
        let unset = Event::new(true, false);
        let unset_handle = current
            .process()
            .handles()
            .alloc(unset, AccessMask::SYNCHRONIZE);
        let sem = Semaphore::new(0, 1).unwrap();
        let sem_handle = current.process().handles().alloc(
            sem.clone(),
            AccessMask::SYNCHRONIZE | AccessMask::SEMAPHORE_MODIFY_STATE,
        );

        let mut req = select_request(
            vec![unset_handle, sem_handle],
            SelectFlags::NONE,
            TIMEOUT_INFINITE,
        );
        req.signal = sem_handle;
        let reply = handle_select(&srv, &current, &req).unwrap();
        assert_eq!(reply.status, Status::from_wait_index(1));
        assert!(read_wakeups(&wake).is_empty());
        assert_eq!(sem.count(), 0);

        // WAIT-ALL where an abandoned mutex colours the verdict.
        let dead = create_thread(&srv, None, current.process()).unwrap();
        let mutex = Mutex::new(Some(&dead));
        kill_thread(&srv, &dead, false);
        assert!(mutex.is_abandoned());

        let mutex_handle = current
            .process()
            .handles()
            .alloc(mutex.clone(), AccessMask::SYNCHRONIZE);
        let event = Event::new(true, false);
        let event_handle = current.process().handles().alloc(
            event,
            AccessMask::SYNCHRONIZE | AccessMask::EVENT_MODIFY_STATE,
        );

        let mut req = select_request(
            vec![mutex_handle, event_handle],
            SelectFlags::ALL,
            TIMEOUT_INFINITE,
        );
        req.signal = event_handle;
        let reply = handle_select(&srv, &current, &req).unwrap();
        assert_eq!(reply.status, Status::ABANDONED_WAIT_0);
        assert!(read_wakeups(&wake).is_empty());
        // Ownership transferred with the abandoned flag consumed.
        assert!(!mutex.is_abandoned());
        assert_eq!(current.held_mutexes.borrow().len(), 1);
    }

    #[test]
    fn test_select_timeout_fires_deterministically() {
        let (srv, _hooks) = test_server();
        let (_process, current, wake) = init_client(&srv);

        let sem = Semaphore::new(0, 1).unwrap();
        let handle = current
            .process()
            .handles()
            .alloc(sem.clone(), AccessMask::SYNCHRONIZE | AccessMask::SEMAPHORE_MODIFY_STATE);

        // Relative 10-tick timeout.
        let reply = handle_select(
            &srv,
            &current,
            &select_request(vec![handle], SelectFlags::NONE, -10),
        )
        .unwrap();
        assert_eq!(reply.status, Status::PENDING);
        assert_eq!(reply.timeout, srv.now() + 10);

        // First tick at the deadline produces TIMEOUT.
        srv.advance_time(10);
        let replies = read_wakeups(&wake);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].signaled, Status::TIMEOUT);

        // A later signal finds no wait and is kept for the next waiter.
        sem.release(&srv, 1).unwrap();
        assert!(read_wakeups(&wake).is_empty());
        let reply = handle_select(
            &srv,
            &current,
            &select_request(vec![handle], SelectFlags::NONE, -5),
        )
        .unwrap();
        assert_eq!(reply.status, Status::from_wait_index(0));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_select_delivers_system_apc() {
        let (srv, _hooks) = test_server();
        let (_process, current, wake) = init_client(&srv);

        // Block interruptibly, then interrupt with a system APC.
        let reply = handle_select(
            &srv,
            &current,
            &select_request(Vec::new(), SelectFlags::INTERRUPTIBLE, TIMEOUT_INFINITE),
        )
        .unwrap();
        assert_eq!(reply.status, Status::PENDING);

        let call = ApcCall::VirtualAlloc { addr: 0, size: 0x1000, zero_bits: 0, op_type: 0, prot: 4 };
        assert!(crate::apc::thread_queue_apc(&srv, &current, None, call.clone()));
        let replies = read_wakeups(&wake);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].signaled, Status::USER_APC);

        // The next select carries the APC out to the client.
        let reply = handle_select(
            &srv,
            &current,
            &select_request(Vec::new(), SelectFlags::INTERRUPTIBLE, 0),
        )
        .unwrap();
        assert_eq!(reply.status, Status::USER_APC);
        assert!(!reply.apc_handle.is_null());
        assert_eq!(reply.call, Some(call));
    }

    #[test]
    fn test_select_create_thread_result_transfers_handle() {
        let (srv, hooks) = test_server();
        let (_process_a, caller, _wake_a) = init_client(&srv);
        let (process_b, executor, wake_b) = init_client(&srv);
        hooks.signal_result.set(true);

        // The executor parks in an interruptible wait so the process-wide
        // queue picks it.
        handle_select(
            &srv,
            &executor,
            &select_request(Vec::new(), SelectFlags::INTERRUPTIBLE, TIMEOUT_INFINITE),
        )
        .unwrap();

        let process_handle = caller
            .process()
            .handles()
            .alloc(process_b.clone(), AccessMask::PROCESS_CREATE_THREAD);
        let call = ApcCall::CreateThread { func: 0x1000, arg: 0, reserve: 0, commit: 0, suspend: false };
        let queued = handle_queue_apc(
            &srv,
            &caller,
            &QueueApcRequest { handle: process_handle, call },
        )
        .unwrap();
        assert!(!queued.self_);
        assert!(!queued.handle.is_null());
        assert_eq!(read_wakeups(&wake_b).len(), 1);

        // The executor picks the APC up.
        let delivery = handle_select(
            &srv,
            &executor,
            &select_request(Vec::new(), SelectFlags::INTERRUPTIBLE, 0),
        )
        .unwrap();
        let apc_handle = delivery.apc_handle;
        assert!(!apc_handle.is_null());

        // It "runs" the call: a new thread exists in B with a handle.
        let spawned = create_thread(&srv, None, &process_b).unwrap();
        let access = AccessMask::THREAD_ALL_ACCESS;
        let spawned_handle = process_b.handles().alloc(spawned.clone(), access);

        let mut req = select_request(Vec::new(), SelectFlags::INTERRUPTIBLE, TIMEOUT_INFINITE);
        req.prev_apc = apc_handle;
        req.result = ApcResult::CreateThread {
            status: Status::SUCCESS,
            tid: spawned.id(),
            handle: spawned_handle,
        };
        handle_select(&srv, &executor, &req).unwrap();

        // The caller fetches the result: the handle now lives in A's
        // table with the same access, and B's handle is closed.
        let result = handle_get_apc_result(
            &srv,
            &caller,
            &GetApcResultRequest { handle: queued.handle },
        )
        .unwrap();
        let ApcResult::CreateThread { status, tid, handle } = result.result else {
            panic!("wrong result kind");
        };
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(tid, spawned.id());
        assert_eq!(caller.process().handles().get_access(handle).unwrap(), access);
        assert_eq!(
            process_b.handles().get_access(spawned_handle).unwrap_err(),
            Status::INVALID_HANDLE
        );
    }

    #[test]
    fn test_queue_apc_async_io_result_forwarded() {
        let (srv, hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);

        let owner: Rc<dyn crate::object::SyncObject> = crate::sync::Event::new(true, false);
        let apc = Apc::create(
            Some(owner),
            ApcCall::AsyncIo { func: 1, user: 2, sb: 3, status: Status::SUCCESS },
        );
        let handle = current.process().handles().alloc(apc.clone(), AccessMask::SYNCHRONIZE);

        let mut req = select_request(Vec::new(), SelectFlags::NONE, -1);
        req.prev_apc = handle;
        req.result = ApcResult::AsyncIo { status: Status::SUCCESS, total: 512, apc: 0x2000 };
        handle_select(&srv, &current, &req).unwrap();

        assert!(apc.executed());
        assert_eq!(*hooks.async_results.borrow(), vec![(Status::SUCCESS, 512, 0x2000)]);
    }

    #[test]
    fn test_queue_apc_rejects_client_timer_and_async() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        for call in [
            ApcCall::Timer { time: 0, arg: 0 },
            ApcCall::AsyncIo { func: 0, user: 0, sb: 0, status: Status::SUCCESS },
        ] {
            let err = handle_queue_apc(
                &srv,
                &current,
                &QueueApcRequest { handle: Handle::NULL, call },
            )
            .unwrap_err();
            assert_eq!(err, Status::INVALID_PARAMETER);
        }
    }

    #[test]
    fn test_queue_apc_user_to_terminated_thread() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        let other = create_thread(&srv, None, current.process()).unwrap();
        let handle = current
            .process()
            .handles()
            .alloc(other.clone(), AccessMask::THREAD_SET_CONTEXT);
        kill_thread(&srv, &other, false);

        let err = handle_queue_apc(
            &srv,
            &current,
            &QueueApcRequest { handle, call: ApcCall::User { func: 1, args: [0; 3] } },
        )
        .unwrap_err();
        assert_eq!(err, Status::THREAD_IS_TERMINATING);
    }

    #[test]
    fn test_get_apc_result_pending() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        let apc = Apc::create(None, ApcCall::User { func: 1, args: [0; 3] });
        let handle = current.process().handles().alloc(apc, AccessMask::SYNCHRONIZE);

        let err =
            handle_get_apc_result(&srv, &current, &GetApcResultRequest { handle }).unwrap_err();
        assert_eq!(err, Status::PENDING);
        // The handle stays open for a retry.
        assert!(current.process().handles().get_access(handle).is_ok());
    }

    fn sample_context(cpu: CpuType) -> Context {
        let mut context = Context::new(cpu);
        context.flags = ContextFlags::CONTROL | ContextFlags::INTEGER;
        context.ctl.ip = 0x0040_2000;
        context.ctl.sp = 0x7ffe_0000;
        context.integer[3] = 0x1122;
        context
    }

    #[test]
    fn test_suspend_context_capture_and_handoff() {
        let (srv, hooks) = test_server();
        let (process, current, _wake) = init_client(&srv);
        let cpu = process.cpu().unwrap();

        current.debug_break.set(true);
        handle_set_suspend_context(
            &srv,
            &current,
            &SetSuspendContextRequest { context: sample_context(cpu) },
        )
        .unwrap();

        // The pending break fired on the captured instruction pointer.
        assert!(hooks.debug_events.borrow().iter().any(|(id, event)| {
            *id == current.id()
                && matches!(
                    event,
                    DebugEvent::Breakpoint { address, code, .. }
                        if *address == 0x0040_2000 && *code == Status::BREAKPOINT
                )
        }));

        // Nested captures are rejected.
        let err = handle_set_suspend_context(
            &srv,
            &current,
            &SetSuspendContextRequest { context: sample_context(cpu) },
        )
        .unwrap_err();
        assert_eq!(err, Status::INVALID_PARAMETER);

        // Handoff is one-shot and clears the capture.
        let reply = handle_get_suspend_context(&srv, &current).unwrap();
        assert_eq!(reply.context.ctl.ip, 0x0040_2000);
        assert!(current.captured().is_none());
        assert_eq!(
            handle_get_suspend_context(&srv, &current).unwrap_err(),
            Status::INVALID_PARAMETER
        );
    }

    #[test]
    fn test_get_thread_context_pending_and_captured() {
        let (srv, _hooks) = test_server();
        let (process, current, _wake) = init_client(&srv);
        let (_other_process, other, _other_wake) = init_client(&srv);
        let cpu = process.cpu().unwrap();

        let handle = current.process().handles().alloc(
            other.clone(),
            AccessMask::THREAD_GET_CONTEXT | AccessMask::THREAD_SUSPEND_RESUME,
        );

        // Running and uncaptured: PENDING, with the requested suspension.
        let reply = handle_get_thread_context(
            &srv,
            &current,
            &GetThreadContextRequest { handle, flags: ContextFlags::CONTROL, suspend: true },
        )
        .unwrap();
        assert!(!reply.self_);
        assert_eq!(reply.status, Status::PENDING);
        assert_eq!(other.suspend_count(), 1);

        // The stopped client posts its context; the retry succeeds.
        handle_set_suspend_context(
            &srv,
            &other,
            &SetSuspendContextRequest { context: sample_context(cpu) },
        )
        .unwrap();
        let reply = handle_get_thread_context(
            &srv,
            &current,
            &GetThreadContextRequest {
                handle,
                flags: ContextFlags::CONTROL | ContextFlags::INTEGER,
                suspend: false,
            },
        )
        .unwrap();
        assert_eq!(reply.status, Status::SUCCESS);
        let context = reply.context.unwrap();
        assert_eq!(context.ctl.ip, 0x0040_2000);
        assert_eq!(context.integer[3], 0x1122);
    }

    #[test]
    fn test_set_thread_context_merges_client_banks() {
        let (srv, _hooks) = test_server();
        let (process, current, _wake) = init_client(&srv);
        let (_other_process, other, _other_wake) = init_client(&srv);
        let cpu = process.cpu().unwrap();

        handle_set_suspend_context(
            &srv,
            &other,
            &SetSuspendContextRequest { context: sample_context(cpu) },
        )
        .unwrap();
        let handle = current
            .process()
            .handles()
            .alloc(other.clone(), AccessMask::THREAD_SET_CONTEXT);

        let mut update = Context::new(cpu);
        update.flags = ContextFlags::CONTROL;
        update.ctl.ip = 0x0055_0000;
        let reply = handle_set_thread_context(
            &srv,
            &current,
            &SetThreadContextRequest { handle, context: update, suspend: false },
        )
        .unwrap();
        assert_eq!(reply.status, Status::SUCCESS);
        assert_eq!(other.captured().unwrap().borrow().ctl.ip, 0x0055_0000);
    }

    #[test]
    fn test_get_selector_entry() {
        let (srv, _hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        let handle = current
            .process()
            .handles()
            .alloc(current.clone(), AccessMask::THREAD_QUERY_INFORMATION);
        let reply = handle_get_selector_entry(
            &srv,
            &current,
            &GetSelectorEntryRequest { handle, entry: 2 },
        )
        .unwrap();
        assert_eq!(reply.base, 0x2000);
        assert_eq!(reply.limit, 0xFFF);
    }

    #[test]
    fn test_kick_signal_sent_for_idle_system_apc_target() {
        let (srv, hooks) = test_server();
        let (_process, current, _wake) = init_client(&srv);
        let other = create_thread(&srv, None, current.process()).unwrap();

        hooks.signal_result.set(true);
        let call = ApcCall::UnmapView { addr: 0x100 };
        assert!(crate::apc::thread_queue_apc(&srv, &other, None, call));
        assert!(hooks
            .signals
            .borrow()
            .iter()
            .any(|(id, signal)| *id == other.id() && *signal == KickSignal::Interrupt));
    }
}
