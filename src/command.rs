//! Recording buffers and their per-queue pool.
//!
//! A [`RecordingBuffer`] is the backing store a [`Context`](crate::Context) records commands
//! into. It goes through the following states:
//!
//! - free: sitting in the pool, ready to be handed out.
//! - in use: owned by exactly one context and open for recording.
//! - retired: submitted, and tagged with the fence value of that submission.
//!
//! A retired buffer is only reset and handed out again once its fence value is complete.
//! The pool grows whenever no free buffer is available and never shrinks.

use std::{fmt::Debug, sync::Mutex};

use crate::{
    Device, HasDevice,
    error::Result,
    fence::{FenceTimeline, FenceValue},
    hal::{Command, QueueKind, RawCommandBuffer},
    retire::RetiredList,
};

/// Backing store for recorded commands.
pub struct RecordingBuffer {
    device: Device,
    raw: RawCommandBuffer,
    queue: QueueKind,
    recording: bool,
}

impl Debug for RecordingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBuffer")
            .field("raw", &self.raw)
            .field("queue", &self.queue)
            .field("recording", &self.recording)
            .finish()
    }
}

impl HasDevice for RecordingBuffer {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl RecordingBuffer {
    fn new(device: Device, queue: QueueKind) -> Result<Self> {
        let raw = device.driver().create_command_buffer(queue)?;
        Ok(Self {
            device,
            raw,
            queue,
            recording: false,
        })
    }

    pub fn raw(&self) -> RawCommandBuffer {
        self.raw
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Resets the buffer and opens it for recording.
    pub(crate) fn begin(&mut self) -> Result<()> {
        self.device.driver().begin_command_buffer(self.raw)?;
        self.recording = true;
        Ok(())
    }

    /// Closes the buffer so it can be submitted.
    pub(crate) fn end(&mut self) -> Result<()> {
        assert!(self.recording, "recording buffer {:?} is not open", self.raw);
        self.device.driver().end_command_buffer(self.raw)?;
        self.recording = false;
        Ok(())
    }

    pub fn record(&mut self, command: Command) {
        assert!(
            self.recording,
            "recording into buffer {:?} that is not open",
            self.raw
        );
        self.device.driver().record(self.raw, command);
    }
}

impl Drop for RecordingBuffer {
    fn drop(&mut self) {
        self.device.driver().destroy_command_buffer(self.raw);
    }
}

#[derive(Default)]
struct PoolState {
    available: Vec<RecordingBuffer>,
    retired: RetiredList<RecordingBuffer>,
    created: usize,
}

/// Recycles the recording buffers of one queue.
pub struct RecordingBufferPool {
    device: Device,
    queue: QueueKind,
    state: Mutex<PoolState>,
}

impl HasDevice for RecordingBufferPool {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl RecordingBufferPool {
    pub fn new(device: Device, queue: QueueKind) -> Self {
        Self {
            device,
            queue,
            state: Mutex::default(),
        }
    }

    /// Returns an open recording buffer, reusing a retired one whose fence is complete.
    pub fn request(&self, timeline: &FenceTimeline) -> Result<RecordingBuffer> {
        let mut buffer = {
            let mut state = self.state.lock().unwrap();
            let PoolState {
                available, retired, ..
            } = &mut *state;
            available.extend(retired.drain_ready(|fence, _| timeline.is_complete(fence)));
            match state.available.pop() {
                Some(buffer) => buffer,
                None => {
                    state.created += 1;
                    tracing::info!(
                        queue = self.queue.name(),
                        total = state.created,
                        "create recording buffer"
                    );
                    RecordingBuffer::new(self.device.clone(), self.queue)?
                }
            }
        };
        buffer.begin()?;
        Ok(buffer)
    }

    /// Hands a submitted buffer back. It becomes available once `fence` is complete.
    pub fn discard(&self, fence: FenceValue, buffer: RecordingBuffer) {
        assert_eq!(buffer.queue, self.queue, "recording buffer returned to the wrong pool");
        assert!(
            !buffer.recording,
            "recording buffer {:?} discarded while still open",
            buffer.raw
        );
        self.state.lock().unwrap().retired.retire(fence, buffer);
    }

    /// Number of buffers this pool has created.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffers waiting for their fence.
    pub fn retired_len(&self) -> usize {
        self.state.lock().unwrap().retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::soft::SoftDriver;

    fn setup() -> (RecordingBufferPool, FenceTimeline) {
        let device = Device::new(SoftDriver::new());
        let timeline = FenceTimeline::new(device.clone(), QueueKind::Graphics, None).unwrap();
        (RecordingBufferPool::new(device, QueueKind::Graphics), timeline)
    }

    fn fence(seq: u64) -> FenceValue {
        FenceValue::new(QueueKind::Graphics, seq)
    }

    #[test]
    fn retired_buffer_waits_for_its_fence() {
        let (pool, timeline) = setup();
        timeline.signal_from_host(fence(5)).unwrap();

        let mut first = pool.request(&timeline).unwrap();
        let first_raw = first.raw();
        first.end().unwrap();
        pool.discard(fence(6), first);

        let mut second = pool.request(&timeline).unwrap();
        assert_ne!(second.raw(), first_raw);
        second.end().unwrap();
        pool.discard(fence(7), second);
        assert_eq!(pool.len(), 2);

        timeline.signal_from_host(fence(6)).unwrap();
        let third = pool.request(&timeline).unwrap();
        assert_eq!(third.raw(), first_raw);
        assert!(third.is_recording());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.retired_len(), 1);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn discard_open_buffer_panics() {
        let (pool, timeline) = setup();
        let buffer = pool.request(&timeline).unwrap();
        pool.discard(fence(1), buffer);
    }

    #[test]
    #[should_panic(expected = "not open")]
    fn record_after_end_panics() {
        let (pool, timeline) = setup();
        let mut buffer = pool.request(&timeline).unwrap();
        buffer.end().unwrap();
        buffer.record(Command::Dispatch { x: 1, y: 1, z: 1 });
    }
}
