//! Execution queues.
//!
//! There is one [`Queue`] per [`QueueKind`]. Work submitted to a queue executes and signals
//! its fence in submission order. Work on different queues is unordered unless one queue is
//! told to [stall](Queue::stall_on) on a fence value of another, which the GPU resolves
//! without involving the CPU.

use std::{fmt::Debug, sync::Mutex, time::Duration};

use crate::{
    Device, HasDevice,
    command::{RecordingBuffer, RecordingBufferPool},
    error::Result,
    fence::{FenceTimeline, FenceValue},
    hal::{QueueKind, RawCommandBuffer},
};

/// An ordered stream of submissions for one queue kind.
pub struct Queue {
    kind: QueueKind,
    timeline: FenceTimeline,
    pool: RecordingBufferPool,
    /// Sequence number the next submission will signal. Held for the whole submission so
    /// fence values are assigned in submission order.
    next_sequence: Mutex<u64>,
}

impl HasDevice for Queue {
    fn device(&self) -> &Device {
        self.timeline.device()
    }
}

impl Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind)
            .field("last_submitted", &self.last_submitted())
            .field("last_completed", &self.timeline.last_completed())
            .finish()
    }
}

impl Queue {
    pub fn new(device: Device, kind: QueueKind, wait_timeout: Option<Duration>) -> Result<Self> {
        let timeline = FenceTimeline::new(device.clone(), kind, wait_timeout)?;
        Ok(Self {
            kind,
            timeline,
            pool: RecordingBufferPool::new(device, kind),
            next_sequence: Mutex::new(1),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn timeline(&self) -> &FenceTimeline {
        &self.timeline
    }

    pub fn buffer_pool(&self) -> &RecordingBufferPool {
        &self.pool
    }

    fn submit_locked(&self, next: &mut u64, buffers: &[RawCommandBuffer]) -> Result<FenceValue> {
        let value = FenceValue::new(self.kind, *next);
        self.device()
            .driver()
            .queue_submit(self.kind, buffers, self.timeline.raw(), value.0)
            .inspect_err(|err| tracing::error!(%err, fence = %value, "queue submission failed"))?;
        *next += 1;
        Ok(value)
    }

    /// Schedules the fence to advance once everything submitted so far has finished and
    /// returns the value to watch for.
    pub fn signal(&self) -> Result<FenceValue> {
        let mut next = self.next_sequence.lock().unwrap();
        self.submit_locked(&mut next, &[])
    }

    /// Closes `buffer`, submits it and signals the fence. The returned value is the one every
    /// resource used by the submission is retired under.
    pub fn execute(&self, buffer: &mut RecordingBuffer) -> Result<FenceValue> {
        assert_eq!(
            buffer.queue(),
            self.kind,
            "recording buffer executed on the wrong queue"
        );
        let mut next = self.next_sequence.lock().unwrap();
        buffer.end()?;
        let value = self.submit_locked(&mut next, &[buffer.raw()])?;
        tracing::debug!(fence = %value, buffer = ?buffer.raw(), "execute");
        Ok(value)
    }

    pub fn is_complete(&self, value: FenceValue) -> bool {
        self.timeline.is_complete(value)
    }

    /// Blocks until `value` is complete.
    pub fn wait(&self, value: FenceValue) -> Result<()> {
        self.timeline.wait(value)
    }

    /// Makes later work on this queue wait on the GPU until `producer` reaches `value`.
    pub fn stall_on(&self, producer: &Queue, value: FenceValue) -> Result<()> {
        assert_eq!(
            value.kind(),
            producer.kind,
            "fence value {value} does not belong to the producer queue"
        );
        let _order = self.next_sequence.lock().unwrap();
        self.device()
            .driver()
            .queue_wait(self.kind, producer.timeline.raw(), value.0)
    }

    /// Makes later work on this queue wait for everything `producer` has submitted so far.
    pub fn stall_on_queue(&self, producer: &Queue) -> Result<()> {
        self.stall_on(producer, producer.last_submitted())
    }

    /// Signals the fence and blocks until the queue has drained.
    pub fn wait_idle(&self) -> Result<()> {
        let value = self.signal()?;
        self.wait(value)
    }

    /// The value signaled by the most recent submission.
    pub fn last_submitted(&self) -> FenceValue {
        FenceValue::new(self.kind, *self.next_sequence.lock().unwrap() - 1)
    }

    /// The most recent value the GPU has completed.
    pub fn last_completed(&self) -> FenceValue {
        self.timeline
            .refresh()
            .unwrap_or_else(|_| self.timeline.last_completed())
    }

    pub fn request_buffer(&self) -> Result<RecordingBuffer> {
        self.pool.request(&self.timeline)
    }

    pub fn discard_buffer(&self, fence: FenceValue, buffer: RecordingBuffer) {
        self.pool.discard(fence, buffer);
    }
}

/// The three queues of a runtime.
#[derive(Debug)]
pub struct QueueSet {
    queues: [Queue; 3],
}

impl QueueSet {
    pub fn new(device: &Device, wait_timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            queues: [
                Queue::new(device.clone(), QueueKind::Graphics, wait_timeout)?,
                Queue::new(device.clone(), QueueKind::Compute, wait_timeout)?,
                Queue::new(device.clone(), QueueKind::Copy, wait_timeout)?,
            ],
        })
    }

    pub fn get(&self, kind: QueueKind) -> &Queue {
        &self.queues[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.queues.iter()
    }

    /// Checks a fence value of any queue.
    pub fn is_fence_complete(&self, value: FenceValue) -> bool {
        self.get(value.kind()).is_complete(value)
    }

    /// Blocks on a fence value of any queue.
    pub fn wait_for_fence(&self, value: FenceValue) -> Result<()> {
        self.get(value.kind()).wait(value)
    }

    /// Waits until every queue has finished all submitted work.
    pub fn idle_gpu(&self) -> Result<()> {
        for queue in &self.queues {
            queue.wait_idle()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Command, soft::SoftDriver};
    use std::sync::Arc;

    fn setup() -> (Arc<SoftDriver>, QueueSet) {
        let driver = Arc::new(SoftDriver::new());
        let device = Device::from_arc(driver.clone());
        let queues = QueueSet::new(&device, None).unwrap();
        (driver, queues)
    }

    #[test]
    fn signals_increase() {
        let (_driver, queues) = setup();
        let queue = queues.get(QueueKind::Compute);
        let a = queue.signal().unwrap();
        let b = queue.signal().unwrap();
        assert!(a < b);
        assert_eq!(b.kind(), QueueKind::Compute);
        assert_eq!(queue.last_submitted(), b);
        queue.wait(b).unwrap();
        assert!(queue.is_complete(a));
        assert!(queues.is_fence_complete(b));
    }

    #[test]
    fn execute_returns_submission_fence() {
        let (driver, queues) = setup();
        let queue = queues.get(QueueKind::Graphics);
        let mut buffer = queue.request_buffer().unwrap();
        buffer.record(Command::Dispatch { x: 2, y: 1, z: 1 });
        let fence = queue.execute(&mut buffer).unwrap();
        assert!(!buffer.is_recording());
        queue.discard_buffer(fence, buffer);
        queues.wait_for_fence(fence).unwrap();
        assert_eq!(driver.stats().dispatches, 1);
        assert_eq!(queue.last_completed(), fence);
    }

    #[test]
    fn stall_orders_queues() {
        let (driver, queues) = setup();
        let copy = queues.get(QueueKind::Copy);
        let compute = queues.get(QueueKind::Compute);
        driver.pause(QueueKind::Copy);
        let produced = copy.signal().unwrap();
        compute.stall_on(copy, produced).unwrap();
        let consumed = compute.signal().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!compute.is_complete(consumed));
        driver.resume(QueueKind::Copy);
        compute.wait(consumed).unwrap();
        assert!(copy.is_complete(produced));
    }

    #[test]
    fn idle_gpu_drains_every_queue() {
        let (driver, queues) = setup();
        driver.pause(QueueKind::Graphics);
        let pending = queues.get(QueueKind::Graphics).signal().unwrap();
        let idle = std::thread::scope(|s| {
            let idle = s.spawn(|| queues.idle_gpu());
            std::thread::sleep(Duration::from_millis(10));
            assert!(!queues.is_fence_complete(pending));
            driver.resume(QueueKind::Graphics);
            idle.join().unwrap()
        });
        idle.unwrap();
        assert!(queues.is_fence_complete(pending));
    }

    #[test]
    #[should_panic(expected = "wrong queue")]
    fn execute_on_wrong_queue_panics() {
        let (_driver, queues) = setup();
        let mut buffer = queues.get(QueueKind::Copy).request_buffer().unwrap();
        queues.get(QueueKind::Compute).execute(&mut buffer).unwrap();
    }
}
