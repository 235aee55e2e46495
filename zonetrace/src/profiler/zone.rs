//! Zone guards and the instrumentation macros

use std::sync::Arc;

use super::Profiler;
use crate::clock;
use crate::domain::Epoch;
use crate::event::{Event, Payload};

/// An open zone; it ends when dropped
///
/// Inactive zones (no profiler, or no collector in on-demand mode) ignore
/// every call. In on-demand mode a zone opened under one collector is not
/// closed under the next: its end is dropped if the epoch moved on.
#[must_use = "the zone ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct Zone {
    active: Option<(Arc<Profiler>, Epoch)>,
}

impl Zone {
    pub(crate) fn active(profiler: Arc<Profiler>, epoch: Epoch) -> Self {
        Self { active: Some((profiler, epoch)) }
    }

    /// A zone that records nothing
    pub fn inactive() -> Self {
        Self { active: None }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn annotate(&self, make: impl FnOnce() -> Event) {
        if let Some((profiler, epoch)) = &self.active {
            if profiler.still_current(*epoch) {
                profiler.enqueue(*epoch, make());
            }
        }
    }

    /// Attach free text to the zone
    pub fn text(&self, text: &str) {
        self.annotate(|| Event::ZoneText { text: Payload::from(text) });
    }

    /// Override the zone's name for this instance
    pub fn name(&self, name: &str) {
        self.annotate(|| Event::ZoneName { text: Payload::from(name) });
    }

    pub fn color(&self, color: u32) {
        self.annotate(|| Event::ZoneColor { color });
    }

    pub fn value(&self, value: u64) {
        self.annotate(|| Event::ZoneValue { value });
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        if let Some((profiler, epoch)) = self.active.take() {
            if profiler.still_current(epoch) {
                profiler.enqueue(epoch, Event::ZoneEnd { time: clock::now() });
            }
        }
    }
}

/// Open a zone at the call site on the process-wide profiler
///
/// ```ignore
/// let _zone = zonetrace::zone!("load_assets", color = 0x2266ff);
/// ```
#[macro_export]
macro_rules! zone {
    (@site $name:expr, $color:expr) => {{
        static __ZONETRACE_SITE: $crate::SourceLocation = $crate::SourceLocation {
            name: $name,
            function: ::core::module_path!(),
            file: ::core::file!(),
            line: ::core::line!(),
            color: $color,
        };
        $crate::zone(&__ZONETRACE_SITE)
    }};
    () => {
        $crate::zone!(@site ::core::option::Option::None, 0)
    };
    ($name:literal) => {
        $crate::zone!(@site ::core::option::Option::Some($name), 0)
    };
    ($name:literal, color = $color:expr) => {
        $crate::zone!(@site ::core::option::Option::Some($name), $color)
    };
}

/// Formatted message on the process-wide profiler
#[macro_export]
macro_rules! message {
    ($($arg:tt)+) => {
        $crate::message(&::std::format!($($arg)+))
    };
}

/// Mark the end of a frame, optionally of a named frame set
#[macro_export]
macro_rules! frame_mark {
    () => {
        $crate::frame_mark()
    };
    ($name:literal) => {
        $crate::frame_mark_named($name)
    };
}

/// Record a plot value
#[macro_export]
macro_rules! plot {
    ($name:literal, $value:expr) => {
        $crate::plot($name, $value)
    };
}

#[cfg(test)]
mod tests {
    use super::super::tests::{drain_events, idle_profiler};
    use super::*;
    use crate::config::Config;
    use crate::event::SourceLocation;

    static LOC: SourceLocation =
        SourceLocation { name: None, function: "zone::tests", file: "zone.rs", line: 1, color: 0 };

    #[test]
    fn test_inactive_zone_ignores_calls() {
        let zone = Zone::inactive();
        assert!(!zone.is_active());
        zone.text("nothing");
        zone.value(3);
    }

    #[test]
    fn test_zone_annotations_follow_begin() {
        let profiler = idle_profiler(Config::local_ephemeral());
        {
            let zone = profiler.zone(&LOC);
            zone.name("renamed");
            zone.color(0xff_00_00);
            zone.value(7);
        }
        let events: Vec<_> = drain_events(&profiler).into_iter().map(|(_, e)| e).collect();
        assert!(matches!(events[0], Event::ZoneBegin { .. }));
        assert!(matches!(&events[1], Event::ZoneName { text } if text.as_bytes() == b"renamed"));
        assert!(matches!(events[2], Event::ZoneColor { color: 0xff_00_00 }));
        assert!(matches!(events[3], Event::ZoneValue { value: 7 }));
        assert!(matches!(events[4], Event::ZoneEnd { .. }));
        profiler.shutdown();
    }

    #[test]
    fn test_zone_end_times_follow_begin() {
        let profiler = idle_profiler(Config::local_ephemeral());
        drop(profiler.zone(&LOC));
        let events: Vec<_> = drain_events(&profiler).into_iter().map(|(_, e)| e).collect();
        match (&events[0], &events[1]) {
            (Event::ZoneBegin { time: begin, .. }, Event::ZoneEnd { time: end }) => assert!(end >= begin),
            other => panic!("unexpected events {other:?}"),
        }
        profiler.shutdown();
    }
}
