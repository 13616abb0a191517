use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hive_core::{OutcomeId, TaskPhase, WorkerId};
use tokio::sync::watch;

/// Requested state of a worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

pub struct WorkerHandle {
    pub outcome_id: OutcomeId,
    pub phase: TaskPhase,
    control: watch::Sender<Control>,
}

/// Live worker loops in this process, keyed by worker id.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<HashMap<WorkerId, WorkerHandle>>>,
}

impl WorkerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerHandle>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a loop and hand back the receiver it should watch.
    pub fn register(&self, worker_id: WorkerId, outcome_id: OutcomeId, phase: TaskPhase) -> watch::Receiver<Control> {
        let (tx, rx) = watch::channel(Control::Run);
        self.lock().insert(worker_id, WorkerHandle { outcome_id, phase, control: tx });
        rx
    }

    pub fn remove(&self, worker_id: &WorkerId) -> bool {
        self.lock().remove(worker_id).is_some()
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.lock().contains_key(worker_id)
    }

    /// False when the worker is not running in this process.
    pub fn signal(&self, worker_id: &WorkerId, control: Control) -> bool {
        match self.lock().get(worker_id) {
            Some(h) => {
                // Stop outranks pause.
                h.control.send_if_modified(|cur| {
                    if *cur == Control::Stop || *cur == control {
                        return false;
                    }
                    *cur = control;
                    true
                });
                true
            }
            None => false,
        }
    }

    pub fn workers_for(&self, outcome_id: &OutcomeId) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> =
            self.lock().iter().filter(|(_, h)| &h.outcome_id == outcome_id).map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_sticky() {
        let reg = WorkerRegistry::default();
        let (w, o) = (WorkerId::from_str("wrk_1"), OutcomeId::from_str("out_1"));
        let rx = reg.register(w.clone(), o.clone(), TaskPhase::Execution);
        assert!(reg.signal(&w, Control::Stop));
        assert!(reg.signal(&w, Control::Pause));
        assert_eq!(*rx.borrow(), Control::Stop);
        assert_eq!(reg.workers_for(&o), vec![w.clone()]);
        assert!(reg.remove(&w));
        assert!(!reg.signal(&w, Control::Stop));
    }
}
