//! Configuration locks on machines.
//!
//! The lock table mirrors what the backend enforces so conflicts are reported
//! before a backend session is opened, and so the registry can tell whether a
//! caller really holds the write lock it claims. The backend stays the final
//! authority: a refusal there is reported as a conflict as well.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use vm_config::RetrySettings;
use vm_core::{LockMode, MachineId, SessionId};
use vm_provider::{ProviderError, VirtualizationBackend};

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::registry::MachineRegistry;

struct HandleInner {
    session: SessionId,
    machine: MachineId,
    machine_name: String,
    mode: LockMode,
    live: AtomicBool,
}

/// A claim on a machine's configuration, obtained from [`SessionLock::acquire`].
///
/// Clones refer to the same claim; releasing any clone releases it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.inner.machine
    }

    pub fn machine_name(&self) -> &str {
        &self.inner.machine_name
    }

    pub fn mode(&self) -> LockMode {
        self.inner.mode
    }

    /// `false` once the handle has been released.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub(crate) fn is_live_writer_for(&self, machine: &MachineId) -> bool {
        self.is_live() && self.mode() == LockMode::Write && self.machine_id() == machine
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.inner.session)
            .field("machine", &self.inner.machine_name)
            .field("mode", &self.inner.mode)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Default)]
struct LockRecord {
    writer: Option<SessionId>,
    shared: HashSet<SessionId>,
}

impl LockRecord {
    fn conflicts_with(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Write => self.writer.is_some() || !self.shared.is_empty(),
            LockMode::Shared => self.writer.is_some(),
        }
    }

    fn describe(&self) -> String {
        if self.writer.is_some() {
            "held for writing".to_string()
        } else {
            format!("held by {} shared session(s)", self.shared.len())
        }
    }

    fn remove(&mut self, session: &SessionId) -> bool {
        if self.writer.as_ref() == Some(session) {
            self.writer = None;
            true
        } else {
            self.shared.remove(session)
        }
    }

    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.shared.is_empty()
    }
}

/// Current holders of a machine's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockHolders {
    pub writer: bool,
    pub shared: usize,
}

/// Lock table service. Clones share one table.
#[derive(Clone)]
pub struct SessionLock {
    backend: Arc<dyn VirtualizationBackend>,
    registry: MachineRegistry,
    table: Arc<Mutex<HashMap<MachineId, LockRecord>>>,
}

impl SessionLock {
    pub fn new(backend: Arc<dyn VirtualizationBackend>, registry: MachineRegistry) -> Self {
        Self {
            backend,
            registry,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<MachineId, LockRecord>>> {
        self.table
            .lock()
            .map_err(|_| OrchestratorError::InvalidState("lock table poisoned".to_string()))
    }

    /// Opens a backend session and locks `machine` in `mode`.
    pub fn acquire(&self, machine: &MachineId, mode: LockMode) -> Result<SessionHandle> {
        let name = self.registry.get(machine)?.name;
        let mut table = self.table()?;

        if let Some(record) = table.get(machine) {
            if record.conflicts_with(mode) {
                return Err(OrchestratorError::LockConflict(format!(
                    "cannot take a {} lock on '{}': {}",
                    mode,
                    name,
                    record.describe()
                )));
            }
        }

        let session = self.backend.create_session()?;
        if let Err(e) = self.backend.lock_machine(&session, machine, mode) {
            if let Err(close) = self.backend.close_session(&session) {
                debug!(%session, error = %close, "Could not close refused session");
            }
            return Err(match e {
                ProviderError::InvalidObjectState(_) | ProviderError::InvalidVmState(_) => {
                    OrchestratorError::LockConflict(format!(
                        "backend refused a {} lock on '{}': {}",
                        mode, name, e
                    ))
                }
                other => other.into(),
            });
        }

        let record = table.entry(*machine).or_default();
        match mode {
            LockMode::Write => record.writer = Some(session),
            LockMode::Shared => {
                record.shared.insert(session);
            }
        }
        drop(table);

        self.registry.note_locked(machine, mode)?;
        debug!(machine = %name, %session, %mode, "Lock acquired");

        Ok(SessionHandle {
            inner: Arc::new(HandleInner {
                session,
                machine: *machine,
                machine_name: name,
                mode,
                live: AtomicBool::new(true),
            }),
        })
    }

    /// Acquires, retrying lock conflicts per `policy`.
    pub async fn acquire_with_retry(
        &self,
        machine: &MachineId,
        mode: LockMode,
        policy: &RetrySettings,
    ) -> Result<SessionHandle> {
        let mut attempt = 1;
        loop {
            match self.acquire(machine, mode) {
                Err(e) if e.is_kind(ErrorKind::LockConflict) && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        %machine,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Lock busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Releases a handle. Releasing it a second time is an `InvalidHandle` error.
    pub fn release(&self, handle: &SessionHandle) -> Result<()> {
        if !handle.inner.live.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::InvalidHandle(format!(
                "session {} on '{}' was already released",
                handle.session_id(),
                handle.machine_name()
            )));
        }

        let last_holder = {
            let mut table = self.table()?;
            match table.get_mut(handle.machine_id()) {
                Some(record) => {
                    record.remove(handle.session_id());
                    let empty = record.is_empty();
                    if empty {
                        table.remove(handle.machine_id());
                    }
                    empty
                }
                None => true,
            }
        };

        let unlocked = self.backend.unlock_machine(handle.session_id());
        if last_holder {
            self.registry.note_unlocked(handle.machine_id())?;
        }
        debug!(
            machine = %handle.machine_name(),
            session = %handle.session_id(),
            "Lock released"
        );
        unlocked.map_err(Into::into)
    }

    pub fn holders(&self, machine: &MachineId) -> LockHolders {
        self.table
            .lock()
            .ok()
            .and_then(|table| {
                table.get(machine).map(|r| LockHolders {
                    writer: r.writer.is_some(),
                    shared: r.shared.len(),
                })
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineState;
    use crate::test_utils::TestHarness;

    #[test]
    fn test_write_excludes_everything() {
        let h = TestHarness::new();
        let vm = h.registered_machine("vmA");

        let writer = h.locks.acquire(&vm.id, LockMode::Write).unwrap();
        assert_eq!(
            h.registry.get(&vm.id).unwrap().state,
            MachineState::Locked(LockMode::Write)
        );

        for mode in [LockMode::Write, LockMode::Shared] {
            let err = h.locks.acquire(&vm.id, mode).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LockConflict);
        }

        h.locks.release(&writer).unwrap();
        assert_eq!(h.registry.get(&vm.id).unwrap().state, MachineState::Registered);
    }

    #[test]
    fn test_shared_holders_coexist() {
        let h = TestHarness::new();
        let vm = h.registered_machine("vmA");

        let a = h.locks.acquire(&vm.id, LockMode::Shared).unwrap();
        let b = h.locks.acquire(&vm.id, LockMode::Shared).unwrap();
        assert_eq!(
            h.locks.holders(&vm.id),
            LockHolders {
                writer: false,
                shared: 2
            }
        );
        assert_eq!(
            h.locks.acquire(&vm.id, LockMode::Write).unwrap_err().kind(),
            ErrorKind::LockConflict
        );

        h.locks.release(&a).unwrap();
        assert_eq!(
            h.registry.get(&vm.id).unwrap().state,
            MachineState::Locked(LockMode::Shared)
        );
        h.locks.release(&b).unwrap();
        assert_eq!(h.registry.get(&vm.id).unwrap().state, MachineState::Registered);
        assert_eq!(h.locks.holders(&vm.id), LockHolders::default());
    }

    #[test]
    fn test_double_release_is_invalid_handle() {
        let h = TestHarness::new();
        let vm = h.registered_machine("vmA");

        let handle = h.locks.acquire(&vm.id, LockMode::Write).unwrap();
        let copy = handle.clone();
        h.locks.release(&handle).unwrap();
        assert!(!copy.is_live());

        let err = h.locks.release(&copy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);

        // The table is still usable afterwards.
        let again = h.locks.acquire(&vm.id, LockMode::Write).unwrap();
        h.locks.release(&again).unwrap();
    }

    #[test]
    fn test_separate_tables_still_conflict_through_backend() {
        let h = TestHarness::new();
        let vm = h.registered_machine("vmA");
        let other = SessionLock::new(h.backend_handle(), h.registry.clone());

        let held = h.locks.acquire(&vm.id, LockMode::Write).unwrap();
        let err = other.acquire(&vm.id, LockMode::Shared).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert!(err.to_string().contains("backend refused"));
        assert_eq!(other.holders(&vm.id), LockHolders::default());

        h.locks.release(&held).unwrap();
        let shared = other.acquire(&vm.id, LockMode::Shared).unwrap();
        other.release(&shared).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let h = TestHarness::new();
        let vm = h.registered_machine("vmA");
        let held = h.locks.acquire(&vm.id, LockMode::Shared).unwrap();

        let policy = RetrySettings {
            max_attempts: 3,
            backoff_ms: 100,
        };
        let start = tokio::time::Instant::now();
        let err = h
            .locks
            .acquire_with_retry(&vm.id, LockMode::Write, &policy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        // 100 ms after the first attempt, 200 ms after the second.
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(300));
        assert!(elapsed < std::time::Duration::from_millis(310));

        h.locks.release(&held).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_once_released() {
        let h = TestHarness::new();
        let vm = h.registered_machine("vmA");
        let held = h.locks.acquire(&vm.id, LockMode::Write).unwrap();

        let locks = h.locks.clone();
        let holder = held.clone();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            locks.release(&holder).unwrap();
        });

        let policy = RetrySettings {
            max_attempts: 5,
            backoff_ms: 100,
        };
        let handle = h
            .locks
            .acquire_with_retry(&vm.id, LockMode::Write, &policy)
            .await
            .unwrap();
        releaser.await.unwrap();
        assert!(!held.is_live());
        h.locks.release(&handle).unwrap();
    }
}
