//! Prefetch state machine for a [`super::File`].

/// Prefetch state for one open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    /// Prefetching is disabled for this file (config or explicit request).
    Off,
    /// Actively prefetching.
    On,
    /// Paused: every attached IO currently disallows prefetching, but may
    /// resume it later.
    Hold,
    /// All IOs have detached; prefetching cannot run until a new IO attaches.
    Stopped,
    /// The bitmap is fully set. Terminal for the life of this file.
    Complete,
}

impl PrefetchState {
    /// `Stopped -> On` on first `AddIO`, if prefetch is enabled by config.
    pub fn on_first_io_attached(self, prefetch_enabled: bool) -> Self {
        match self {
            PrefetchState::Stopped if prefetch_enabled => PrefetchState::On,
            PrefetchState::Stopped => PrefetchState::Off,
            other => other,
        }
    }

    /// `On -> Hold` when every attached IO has `allow_prefetching = false`.
    pub fn on_all_ios_quiet(self) -> Self {
        match self {
            PrefetchState::On => PrefetchState::Hold,
            other => other,
        }
    }

    /// `Hold -> On` when at least one attached IO allows prefetching again.
    pub fn on_any_io_resumed(self) -> Self {
        match self {
            PrefetchState::Hold => PrefetchState::On,
            other => other,
        }
    }

    /// `On|Hold -> Stopped` on emergency shutdown.
    pub fn on_emergency_shutdown(self) -> Self {
        match self {
            PrefetchState::Complete => PrefetchState::Complete,
            _ => PrefetchState::Stopped,
        }
    }

    /// `On|Hold -> Stopped` when the last attached IO detaches.
    pub fn on_last_io_detached(self) -> Self {
        match self {
            PrefetchState::On | PrefetchState::Hold => PrefetchState::Stopped,
            other => other,
        }
    }

    /// `* -> Complete` when the bitmap becomes fully set. Terminal.
    pub fn on_bitmap_complete(self) -> Self {
        PrefetchState::Complete
    }

    pub fn is_active(self) -> bool {
        matches!(self, PrefetchState::On)
    }

    pub fn is_terminal_complete(self) -> bool {
        matches!(self, PrefetchState::Complete)
    }
}
