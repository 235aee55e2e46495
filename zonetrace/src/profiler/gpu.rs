//! GPU timing contexts
//!
//! A GPU API wrapper creates one [`GpuContext`] per queue. CPU-side zone
//! boundaries go out immediately; the matching GPU timestamps arrive later
//! through [`GpuContext::time`] once the query results are read back.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::Profiler;
use crate::clock;
use crate::domain::ThreadId;
use crate::event::{Event, Payload, SourceLocation};

static NEXT_CONTEXT: AtomicU8 = AtomicU8::new(0);

/// `GpuNewContext` flag: timestamps need periodic calibration
pub const GPU_CONTEXT_CALIBRATION: u8 = 1 << 0;

#[derive(Debug)]
pub struct GpuContext {
    profiler: Arc<Profiler>,
    context: u8,
}

impl Profiler {
    /// Announce a GPU queue whose clock read `gpu_time` just now
    ///
    /// `period` is nanoseconds per GPU tick.
    pub fn gpu_context(self: &Arc<Self>, gpu_time: i64, period: f32, flags: u8) -> GpuContext {
        let context = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        let (cpu_time, thread) = (clock::now(), ThreadId::current().0);
        self.submit_deferred(|| Event::GpuNewContext { cpu_time, gpu_time, thread, period, context, flags });
        GpuContext { profiler: Arc::clone(self), context }
    }
}

impl GpuContext {
    #[must_use]
    pub fn id(&self) -> u8 {
        self.context
    }

    pub fn set_name(&self, name: &str) {
        let context = self.context;
        self.profiler.submit_deferred(|| Event::GpuContextName { context, name: Payload::from(name) });
    }

    /// CPU side of a GPU zone start; `query_id` names the timestamp query
    pub fn zone_begin(&self, query_id: u16, srcloc: &'static SourceLocation) {
        let context = self.context;
        self.profiler.submit(|| Event::GpuZoneBegin {
            cpu_time: clock::now(),
            thread: ThreadId::current().0,
            query_id,
            context,
            srcloc,
        });
    }

    pub fn zone_end(&self, query_id: u16) {
        let context = self.context;
        self.profiler.submit(|| Event::GpuZoneEnd {
            cpu_time: clock::now(),
            thread: ThreadId::current().0,
            query_id,
            context,
        });
    }

    /// Result of timestamp query `query_id`
    pub fn time(&self, query_id: u16, gpu_time: i64) {
        let context = self.context;
        self.profiler.submit(|| Event::GpuTime { gpu_time, query_id, context });
    }

    /// Re-align the GPU clock; `cpu_delta` is CPU time elapsed since the last calibration
    pub fn calibrate(&self, gpu_time: i64, cpu_delta: i64) {
        let context = self.context;
        self.profiler.submit(|| Event::GpuCalibration { gpu_time, cpu_time: clock::now(), cpu_delta, context });
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::idle_profiler;
    use super::*;
    use crate::config::Config;
    use crate::event::QueueItem;

    static DRAW: SourceLocation =
        SourceLocation { name: Some("draw"), function: "gpu::tests", file: "gpu.rs", line: 1, color: 0 };

    #[test]
    fn test_gpu_context_events_go_serial_in_order() {
        let profiler = idle_profiler(Config::local_ephemeral());
        let gpu = profiler.gpu_context(1_000, 1.0, GPU_CONTEXT_CALIBRATION);
        gpu.set_name("graphics");
        gpu.zone_begin(0, &DRAW);
        gpu.zone_end(1);
        gpu.time(0, 1_100);
        gpu.time(1, 1_900);

        let mut batch: Vec<QueueItem> = Vec::new();
        profiler.shared.serial.swap(&mut batch);
        let context = gpu.id();
        assert_eq!(batch.len(), 6);
        assert!(matches!(batch[0].event, Event::GpuNewContext { context: c, flags: 1, .. } if c == context));
        assert!(matches!(batch[1].event, Event::GpuContextName { .. }));
        assert!(matches!(batch[2].event, Event::GpuZoneBegin { query_id: 0, .. }));
        assert!(matches!(batch[3].event, Event::GpuZoneEnd { query_id: 1, .. }));
        assert!(matches!(batch[5].event, Event::GpuTime { gpu_time: 1_900, query_id: 1, .. }));
        profiler.shutdown();
    }
}
