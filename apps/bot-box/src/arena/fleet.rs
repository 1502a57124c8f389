use std::sync::Arc;

use arena_proto::BotId;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Default)]
struct SlotState {
    status: SlotStatus,
    ready: bool,
}

#[derive(Debug)]
struct FleetState {
    controls_allowed: bool,
    slots: Vec<SlotState>,
}

/// Fleet-wide flags shared by the orchestrator and every slot.
///
/// `all_ready` is computed from the per-slot flags under the same lock, so it
/// can never disagree with them.
#[derive(Debug, Clone)]
pub struct Fleet {
    inner: Arc<RwLock<FleetState>>,
}

impl Fleet {
    pub fn new(n_bots: usize, controls_allowed: bool) -> Self {
        let slots = (0..n_bots).map(|_| SlotState::default()).collect();
        Self {
            inner: Arc::new(RwLock::new(FleetState {
                controls_allowed,
                slots,
            })),
        }
    }

    pub fn controls_allowed(&self) -> bool {
        self.inner.read().controls_allowed
    }

    pub fn set_controls_allowed(&self, allowed: bool) {
        self.inner.write().controls_allowed = allowed;
    }

    pub fn all_ready(&self) -> bool {
        self.inner.read().slots.iter().all(|slot| slot.ready)
    }

    /// Both gates a `CONTROLS` message must pass, read under one lock.
    pub fn controls_open(&self) -> bool {
        let state = self.inner.read();
        state.controls_allowed && state.slots.iter().all(|slot| slot.ready)
    }

    pub fn is_ready(&self, id: BotId) -> bool {
        self.inner.read().slots.get(id).is_some_and(|slot| slot.ready)
    }

    /// Updates one slot's readiness and returns the resulting fleet-wide flag.
    pub fn set_ready(&self, id: BotId, ready: bool) -> bool {
        let mut state = self.inner.write();
        if let Some(slot) = state.slots.get_mut(id) {
            slot.ready = ready;
        }
        state.slots.iter().all(|slot| slot.ready)
    }

    pub fn status(&self, id: BotId) -> Option<SlotStatus> {
        self.inner.read().slots.get(id).map(|slot| slot.status)
    }

    pub fn set_status(&self, id: BotId, status: SlotStatus) {
        if let Some(slot) = self.inner.write().slots.get_mut(id) {
            slot.status = status;
        }
    }
}
