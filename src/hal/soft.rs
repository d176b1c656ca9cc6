//! A software GPU.
//!
//! [`SoftDriver`] runs every queue on its own worker thread. Submissions travel through a
//! channel, so work on one queue executes strictly in submission order while the submitting
//! thread returns immediately, like a real device. Copies and fills operate on host memory,
//! views are plain [`ViewDesc`] arrays, and draws and dispatches only bump counters.
//!
//! On top of the [`Driver`] interface the software driver offers the hooks the tests need:
//! pausing a queue so its submissions stay pending, reading back buffers and views,
//! simulating device loss and counting what was executed.
//!
//! The driver also checks the contracts a validation layer would check: recording into a
//! buffer that is not open, resetting a buffer whose submission has not completed, and
//! submitting to a queue of the wrong kind all panic.

use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};

use super::{
    BufferAllocation, Command, CpuView, Driver, MemoryKind, QueueKind, RawBuffer,
    RawCommandBuffer, RawFence, RawViewTable, ViewDesc, ViewTableKind,
};
use crate::error::{GpuError, Result};

/// Counters of everything the software GPU has executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftStats {
    /// Submissions per queue, indexed by [`QueueKind::index`]. Bare signals count too.
    pub submissions: [u64; 3],
    pub barrier_batches: u64,
    pub barriers: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub fills: u64,
    pub pipeline_binds: u64,
    pub table_binds: u64,
    /// Calls to [`Driver::copy_views`].
    pub view_copy_ops: u64,
    pub views_copied: u64,
}

/// Number of live native objects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub fences: usize,
    pub command_buffers: usize,
    pub buffers: usize,
    pub view_tables: usize,
}

#[derive(Default)]
struct Counters {
    submissions: [AtomicU64; 3],
    barrier_batches: AtomicU64,
    barriers: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
    copies: AtomicU64,
    fills: AtomicU64,
    pipeline_binds: AtomicU64,
    table_binds: AtomicU64,
    view_copy_ops: AtomicU64,
    views_copied: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

struct SoftFence {
    value: Mutex<u64>,
    cond: Condvar,
}

impl SoftFence {
    fn current(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    fn advance(&self, value: u64) {
        let mut current = self.value.lock().unwrap();
        if value > *current {
            *current = value;
            self.cond.notify_all();
        }
    }

    fn wait(&self, lost: &AtomicBool, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = self.value.lock().unwrap();
        loop {
            if *current >= value {
                return Ok(true);
            }
            if lost.load(Ordering::SeqCst) {
                return Err(GpuError::DeviceLost);
            }
            current = match deadline {
                None => self.cond.wait(current).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.cond.wait_timeout(current, deadline - now).unwrap().0
                }
            };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

struct SoftCommandBuffer {
    queue: QueueKind,
    state: CommandBufferState,
    commands: Vec<Command>,
    in_flight: Option<(Arc<SoftFence>, u64)>,
}

struct SoftBuffer {
    ptr: *mut u8,
    len: usize,
    kind: MemoryKind,
}
unsafe impl Send for SoftBuffer {}

impl Drop for SoftBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

struct SoftTable {
    kind: ViewTableKind,
    shader_visible: bool,
    views: Vec<ViewDesc>,
}

struct Gate {
    paused: Mutex<bool>,
    cond: Condvar,
}

enum Job {
    Execute {
        commands: Vec<Command>,
        fence: Arc<SoftFence>,
        value: u64,
    },
    Wait {
        fence: Arc<SoftFence>,
        value: u64,
    },
}

struct Shared {
    next_handle: AtomicU64,
    lost: AtomicBool,
    fences: Mutex<HashMap<u64, Arc<SoftFence>>>,
    command_buffers: Mutex<HashMap<u64, SoftCommandBuffer>>,
    buffers: Mutex<HashMap<u64, SoftBuffer>>,
    tables: Mutex<HashMap<u64, SoftTable>>,
    gates: [Gate; 3],
    counters: Counters,
}

impl Shared {
    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn fence(&self, fence: RawFence) -> Arc<SoftFence> {
        self.fences
            .lock()
            .unwrap()
            .get(&fence.0)
            .unwrap_or_else(|| panic!("unknown fence {fence:?}"))
            .clone()
    }

    /// Wakes every thread blocked on a fence or a paused queue so it can observe `lost`.
    fn abort(&self) {
        self.lost.store(true, Ordering::SeqCst);
        for fence in self.fences.lock().unwrap().values() {
            let _guard = fence.value.lock().unwrap();
            fence.cond.notify_all();
        }
        for gate in &self.gates {
            let _guard = gate.paused.lock().unwrap();
            gate.cond.notify_all();
        }
    }

    /// Blocks while the queue is paused. Returns false if the device was lost meanwhile.
    fn pass_gate(&self, queue: QueueKind) -> bool {
        let gate = &self.gates[queue.index()];
        let mut paused = gate.paused.lock().unwrap();
        while *paused && !self.lost.load(Ordering::SeqCst) {
            paused = gate.cond.wait(paused).unwrap();
        }
        !self.lost.load(Ordering::SeqCst)
    }

    fn execute(&self, commands: Vec<Command>) {
        let counters = &self.counters;
        for command in commands {
            match command {
                Command::Barriers(barriers) => {
                    bump(&counters.barrier_batches, 1);
                    bump(&counters.barriers, barriers.len() as u64);
                }
                Command::BindPipeline { .. } => bump(&counters.pipeline_binds, 1),
                Command::BindViewTable { .. } => bump(&counters.table_binds, 1),
                Command::Draw { .. } | Command::DrawIndexed { .. } => bump(&counters.draws, 1),
                Command::Dispatch { .. } => bump(&counters.dispatches, 1),
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let buffers = self.buffers.lock().unwrap();
                    match (buffers.get(&src.0), buffers.get(&dst.0)) {
                        (Some(src), Some(dst)) => unsafe {
                            std::ptr::copy(
                                src.ptr.add(src_offset as usize),
                                dst.ptr.add(dst_offset as usize),
                                size as usize,
                            );
                        },
                        _ => tracing::error!(?src, ?dst, "copy between destroyed buffers"),
                    }
                    bump(&counters.copies, 1);
                }
                Command::FillBuffer {
                    dst,
                    offset,
                    size,
                    value,
                } => {
                    let buffers = self.buffers.lock().unwrap();
                    if let Some(dst) = buffers.get(&dst.0) {
                        let bytes = value.to_le_bytes();
                        for i in 0..size as usize {
                            unsafe {
                                *dst.ptr.add(offset as usize + i) = bytes[i % 4];
                            }
                        }
                    } else {
                        tracing::error!(?dst, "fill of a destroyed buffer");
                    }
                    bump(&counters.fills, 1);
                }
            }
        }
    }

    fn check_buffer_range(&self, buffer: RawBuffer, offset: u64, size: u64) {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers
            .get(&buffer.0)
            .unwrap_or_else(|| panic!("unknown buffer {buffer:?}"));
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= buf.len as u64),
            "range {offset}+{size} out of bounds of {buffer:?} ({} bytes)",
            buf.len
        );
    }
}

fn run_queue(shared: Arc<Shared>, queue: QueueKind, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        if !shared.pass_gate(queue) {
            continue;
        }
        match job {
            Job::Execute {
                commands,
                fence,
                value,
            } => {
                shared.execute(commands);
                fence.advance(value);
            }
            Job::Wait { fence, value } => {
                // Only fails when the device is lost, in which case everything is dropped.
                let _ = fence.wait(&shared.lost, value, None);
            }
        }
    }
}

/// The software driver. See the [module documentation](self).
pub struct SoftDriver {
    shared: Arc<Shared>,
    senders: Vec<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDriver {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            next_handle: AtomicU64::new(1),
            lost: AtomicBool::new(false),
            fences: Mutex::default(),
            command_buffers: Mutex::default(),
            buffers: Mutex::default(),
            tables: Mutex::default(),
            gates: std::array::from_fn(|_| Gate {
                paused: Mutex::new(false),
                cond: Condvar::new(),
            }),
            counters: Counters::default(),
        });
        let mut senders = Vec::with_capacity(3);
        let mut workers = Vec::with_capacity(3);
        for queue in QueueKind::ALL {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let shared = shared.clone();
            let worker = std::thread::Builder::new()
                .name(format!("scoria soft {} queue", queue.name()))
                .spawn(move || run_queue(shared, queue, receiver))
                .expect("failed to spawn a software queue thread");
            senders.push(sender);
            workers.push(worker);
        }
        Self {
            shared,
            senders,
            workers,
        }
    }

    /// Stops the queue from starting new work. Submissions keep queueing up.
    pub fn pause(&self, queue: QueueKind) {
        *self.shared.gates[queue.index()].paused.lock().unwrap() = true;
    }

    /// Lets a paused queue run again.
    pub fn resume(&self, queue: QueueKind) {
        let gate = &self.shared.gates[queue.index()];
        *gate.paused.lock().unwrap() = false;
        gate.cond.notify_all();
    }

    /// Simulates device removal: pending work is dropped, waits fail with
    /// [`GpuError::DeviceLost`] and so does every later fallible call.
    pub fn lose_device(&self) {
        tracing::error!("software device lost");
        self.shared.abort();
    }

    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::SeqCst)
    }

    /// Reads a view slot of any table.
    pub fn read_view(&self, table: RawViewTable, index: u32) -> ViewDesc {
        let tables = self.shared.tables.lock().unwrap();
        let table = tables
            .get(&table.0)
            .unwrap_or_else(|| panic!("unknown view table {table:?}"));
        table.views[index as usize]
    }

    /// Returns a copy of `len` bytes of a buffer starting at `offset`.
    pub fn read_buffer(&self, buffer: RawBuffer, offset: u64, len: usize) -> Vec<u8> {
        self.shared.check_buffer_range(buffer, offset, len as u64);
        let buffers = self.shared.buffers.lock().unwrap();
        let buf = &buffers[&buffer.0];
        unsafe { std::slice::from_raw_parts(buf.ptr.add(offset as usize), len).to_vec() }
    }

    /// The memory kind a buffer was created with.
    pub fn buffer_kind(&self, buffer: RawBuffer) -> Option<MemoryKind> {
        self.shared
            .buffers
            .lock()
            .unwrap()
            .get(&buffer.0)
            .map(|b| b.kind)
    }

    /// The size in bytes of a buffer.
    pub fn buffer_len(&self, buffer: RawBuffer) -> Option<u64> {
        self.shared
            .buffers
            .lock()
            .unwrap()
            .get(&buffer.0)
            .map(|b| b.len as u64)
    }

    pub fn stats(&self) -> SoftStats {
        let c = &self.shared.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SoftStats {
            submissions: std::array::from_fn(|i| load(&c.submissions[i])),
            barrier_batches: load(&c.barrier_batches),
            barriers: load(&c.barriers),
            draws: load(&c.draws),
            dispatches: load(&c.dispatches),
            copies: load(&c.copies),
            fills: load(&c.fills),
            pipeline_binds: load(&c.pipeline_binds),
            table_binds: load(&c.table_binds),
            view_copy_ops: load(&c.view_copy_ops),
            views_copied: load(&c.views_copied),
        }
    }

    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            fences: self.shared.fences.lock().unwrap().len(),
            command_buffers: self.shared.command_buffers.lock().unwrap().len(),
            buffers: self.shared.buffers.lock().unwrap().len(),
            view_tables: self.shared.tables.lock().unwrap().len(),
        }
    }
}

impl Drop for SoftDriver {
    fn drop(&mut self) {
        self.shared.abort();
        self.senders.clear();
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}

impl Driver for SoftDriver {
    fn name(&self) -> &str {
        "soft"
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence> {
        self.shared.check_lost()?;
        let handle = self.shared.handle();
        self.shared.fences.lock().unwrap().insert(
            handle,
            Arc::new(SoftFence {
                value: Mutex::new(initial_value),
                cond: Condvar::new(),
            }),
        );
        Ok(RawFence(handle))
    }

    fn destroy_fence(&self, fence: RawFence) {
        self.shared.fences.lock().unwrap().remove(&fence.0);
    }

    fn fence_value(&self, fence: RawFence) -> Result<u64> {
        self.shared.check_lost()?;
        Ok(self.shared.fence(fence).current())
    }

    fn wait_fence(&self, fence: RawFence, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let fence = self.shared.fence(fence);
        fence.wait(&self.shared.lost, value, timeout)
    }

    fn signal_fence(&self, fence: RawFence, value: u64) -> Result<()> {
        self.shared.check_lost()?;
        self.shared.fence(fence).advance(value);
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: QueueKind,
        buffers: &[RawCommandBuffer],
        fence: RawFence,
        value: u64,
    ) -> Result<()> {
        self.shared.check_lost()?;
        let fence = self.shared.fence(fence);
        let mut commands = Vec::new();
        {
            let mut command_buffers = self.shared.command_buffers.lock().unwrap();
            for raw in buffers {
                let cb = command_buffers
                    .get_mut(&raw.0)
                    .unwrap_or_else(|| panic!("unknown command buffer {raw:?}"));
                assert_eq!(
                    cb.state,
                    CommandBufferState::Executable,
                    "command buffer {raw:?} must be closed before submission"
                );
                assert_eq!(
                    cb.queue, queue,
                    "command buffer {raw:?} submitted to the wrong queue"
                );
                commands.append(&mut cb.commands);
                cb.state = CommandBufferState::Pending;
                cb.in_flight = Some((fence.clone(), value));
            }
        }
        bump(&self.shared.counters.submissions[queue.index()], 1);
        self.senders[queue.index()]
            .send(Job::Execute {
                commands,
                fence,
                value,
            })
            .map_err(|_| GpuError::DeviceLost)
    }

    fn queue_wait(&self, queue: QueueKind, fence: RawFence, value: u64) -> Result<()> {
        self.shared.check_lost()?;
        let fence = self.shared.fence(fence);
        self.senders[queue.index()]
            .send(Job::Wait { fence, value })
            .map_err(|_| GpuError::DeviceLost)
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<RawCommandBuffer> {
        self.shared.check_lost()?;
        let handle = self.shared.handle();
        self.shared.command_buffers.lock().unwrap().insert(
            handle,
            SoftCommandBuffer {
                queue,
                state: CommandBufferState::Initial,
                commands: Vec::new(),
                in_flight: None,
            },
        );
        Ok(RawCommandBuffer(handle))
    }

    fn destroy_command_buffer(&self, buffer: RawCommandBuffer) {
        self.shared.command_buffers.lock().unwrap().remove(&buffer.0);
    }

    fn begin_command_buffer(&self, buffer: RawCommandBuffer) -> Result<()> {
        self.shared.check_lost()?;
        let mut command_buffers = self.shared.command_buffers.lock().unwrap();
        let cb = command_buffers
            .get_mut(&buffer.0)
            .unwrap_or_else(|| panic!("unknown command buffer {buffer:?}"));
        if let Some((fence, value)) = &cb.in_flight {
            assert!(
                fence.current() >= *value,
                "recording buffer {buffer:?} reset while its submission is still in flight"
            );
        }
        cb.in_flight = None;
        cb.commands.clear();
        cb.state = CommandBufferState::Recording;
        Ok(())
    }

    fn end_command_buffer(&self, buffer: RawCommandBuffer) -> Result<()> {
        self.shared.check_lost()?;
        let mut command_buffers = self.shared.command_buffers.lock().unwrap();
        let cb = command_buffers
            .get_mut(&buffer.0)
            .unwrap_or_else(|| panic!("unknown command buffer {buffer:?}"));
        assert_eq!(
            cb.state,
            CommandBufferState::Recording,
            "command buffer {buffer:?} is not recording"
        );
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    fn record(&self, buffer: RawCommandBuffer, command: Command) {
        match &command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.shared.check_buffer_range(*src, *src_offset, *size);
                self.shared.check_buffer_range(*dst, *dst_offset, *size);
            }
            Command::FillBuffer {
                dst, offset, size, ..
            } => {
                assert!(offset % 4 == 0 && size % 4 == 0, "fill range must be 4-byte aligned");
                self.shared.check_buffer_range(*dst, *offset, *size);
            }
            _ => (),
        }
        let mut command_buffers = self.shared.command_buffers.lock().unwrap();
        let cb = command_buffers
            .get_mut(&buffer.0)
            .unwrap_or_else(|| panic!("unknown command buffer {buffer:?}"));
        assert_eq!(
            cb.state,
            CommandBufferState::Recording,
            "recording into command buffer {buffer:?} that is not open"
        );
        cb.commands.push(command);
    }

    fn create_buffer(&self, kind: MemoryKind, size: u64) -> Result<BufferAllocation> {
        self.shared.check_lost()?;
        let len = usize::try_from(size).map_err(|_| GpuError::OutOfHostMemory)?;
        let memory = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(memory) as *mut u8;
        let handle = self.shared.handle();
        self.shared
            .buffers
            .lock()
            .unwrap()
            .insert(handle, SoftBuffer { ptr, len, kind });
        Ok(BufferAllocation {
            handle: RawBuffer(handle),
            mapped: match kind {
                MemoryKind::Upload => NonNull::new(ptr),
                MemoryKind::Scratch => None,
            },
            gpu_address: handle << 32,
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.shared.buffers.lock().unwrap().remove(&buffer.0);
    }

    fn create_view_table(
        &self,
        kind: ViewTableKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<RawViewTable> {
        self.shared.check_lost()?;
        let handle = self.shared.handle();
        self.shared.tables.lock().unwrap().insert(
            handle,
            SoftTable {
                kind,
                shader_visible,
                views: vec![ViewDesc::Null; capacity as usize],
            },
        );
        Ok(RawViewTable(handle))
    }

    fn destroy_view_table(&self, table: RawViewTable) {
        self.shared.tables.lock().unwrap().remove(&table.0);
    }

    fn write_view(&self, table: RawViewTable, index: u32, view: &ViewDesc) {
        let mut tables = self.shared.tables.lock().unwrap();
        let t = tables
            .get_mut(&table.0)
            .unwrap_or_else(|| panic!("unknown view table {table:?}"));
        assert!(
            view.table_kind().is_none_or(|kind| kind == t.kind),
            "{view:?} cannot be placed in a {:?} table",
            t.kind
        );
        let slot = t
            .views
            .get_mut(index as usize)
            .unwrap_or_else(|| panic!("view index {index} out of bounds of {table:?}"));
        *slot = *view;
    }

    fn copy_views(&self, dst: RawViewTable, dst_start: u32, src: &[CpuView]) {
        let mut tables = self.shared.tables.lock().unwrap();
        let views: Vec<ViewDesc> = src
            .iter()
            .map(|view| {
                let table = tables
                    .get(&view.table.0)
                    .unwrap_or_else(|| panic!("unknown view table {:?}", view.table));
                assert!(!table.shader_visible, "copy source must be CPU-visible");
                table.views[view.index as usize]
            })
            .collect();
        let t = tables
            .get_mut(&dst.0)
            .unwrap_or_else(|| panic!("unknown view table {dst:?}"));
        let start = dst_start as usize;
        assert!(
            start + views.len() <= t.views.len(),
            "view copy out of bounds of {dst:?}"
        );
        t.views[start..start + views.len()].copy_from_slice(&views);
        bump(&self.shared.counters.view_copy_ops, 1);
        bump(&self.shared.counters.views_copied, views.len() as u64);
    }
}
