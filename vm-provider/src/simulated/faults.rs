use std::collections::{HashMap, VecDeque};

use vm_core::error::ErrorDetail;

/// Backend call a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateMachine,
    RegisterMachine,
    LockMachine,
    OpenMedium,
    CreateBaseStorage,
    AttachDevice,
    SaveSettings,
    LaunchProcess,
    PowerDown,
    UnregisterMachine,
    DeleteConfig,
}

/// What happens when a fault fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The call fails with this cause chain (most specific first). For
    /// asynchronous calls the progress object completes with the chain.
    Fail(Vec<ErrorDetail>),
    /// Asynchronous calls never complete. Ignored by synchronous calls.
    Hang,
}

/// One-shot faults queued per call site.
#[derive(Debug, Default)]
pub(super) struct FaultPlan {
    queued: HashMap<FaultPoint, VecDeque<Fault>>,
}

impl FaultPlan {
    pub fn push(&mut self, point: FaultPoint, fault: Fault) {
        self.queued.entry(point).or_default().push_back(fault);
    }

    pub fn take(&mut self, point: FaultPoint) -> Option<Fault> {
        self.queued.get_mut(&point).and_then(|q| q.pop_front())
    }

    pub fn clear(&mut self) {
        self.queued.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faults_fire_once_in_order() {
        let mut plan = FaultPlan::default();
        plan.push(FaultPoint::PowerDown, Fault::Hang);
        plan.push(FaultPoint::PowerDown, Fault::Fail(vec![]));

        assert_eq!(plan.take(FaultPoint::PowerDown), Some(Fault::Hang));
        assert_eq!(plan.take(FaultPoint::PowerDown), Some(Fault::Fail(vec![])));
        assert_eq!(plan.take(FaultPoint::PowerDown), None);
        assert_eq!(plan.take(FaultPoint::SaveSettings), None);
    }
}
