use arena_proto::IceCandidate;
use parking_lot::Mutex;

#[derive(Default)]
struct GateState {
    open: bool,
    pending: Vec<IceCandidate>,
}

/// Holds locally discovered candidates until the answer has been produced.
///
/// Emission happens under the lock, so a candidate discovered while the gate
/// is opening can never overtake the buffered ones.
pub struct CandidateGate {
    state: Mutex<GateState>,
    emit: Box<dyn Fn(IceCandidate) + Send + Sync>,
}

impl CandidateGate {
    pub fn new(emit: impl Fn(IceCandidate) + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            emit: Box::new(emit),
        }
    }

    /// Emits the candidate if the gate is open, otherwise buffers it. Returns `true` if emitted.
    pub fn offer(&self, candidate: IceCandidate) -> bool {
        let mut state = self.state.lock();
        if state.open {
            (self.emit)(candidate);
            true
        } else {
            state.pending.push(candidate);
            false
        }
    }

    /// Opens the gate and flushes the buffer in arrival order. Returns how many were flushed.
    pub fn open(&self) -> usize {
        let mut state = self.state.lock();
        if state.open {
            return 0;
        }
        state.open = true;
        let pending = std::mem::take(&mut state.pending);
        let flushed = pending.len();
        for candidate in pending {
            (self.emit)(candidate);
        }
        flushed
    }
}
