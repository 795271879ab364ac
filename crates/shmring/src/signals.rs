use crate::errors::RingError;
use crate::paths;
use crate::semaphore::{NamedSemaphore, SemaphoreError, SemaphoreOptions, close_shared};
use std::sync::Arc;

/// Coordination semaphores shared by the writer and its readers.
///
/// Handles are reference-counted so they can move into blocking waits.
#[derive(Clone)]
pub struct Signals {
    /// One token per registered waiter per publish round.
    pub data_ready: Arc<NamedSemaphore>,
    /// Posted when the last reader acknowledges a wraparound, or leaves during one.
    pub batch_complete: Arc<NamedSemaphore>,
    /// Binary gate: waiter registration vs. wake-up rounds.
    pub gate: Arc<NamedSemaphore>,
    /// Parity of completed wraparounds (0 or 1), read as a value only.
    pub generation: Arc<NamedSemaphore>,
}

impl Signals {
    /// Exclusive-create all four. On failure the ones already created are unlinked.
    pub fn create(key: u32, permissions: u32) -> Result<Self, RingError> {
        let specs = [
            (paths::data_ready_name(key), 0),
            (paths::batch_complete_name(key), 0),
            (paths::wait_gate_name(key), 1),
            (paths::batch_generation_name(key), 0),
        ];

        let mut opened: Vec<NamedSemaphore> = Vec::with_capacity(specs.len());
        for (name, initial) in &specs {
            let options = SemaphoreOptions {
                permissions,
                ..SemaphoreOptions::exclusive(*initial)
            };
            match NamedSemaphore::open(name, options) {
                Ok(sem) => opened.push(sem),
                Err(e) => {
                    for sem in &opened {
                        let _ = sem.unlink();
                    }
                    return Err(e.into());
                }
            }
        }
        Self::from_handles(opened)
    }

    /// Open existing semaphores only.
    pub fn attach(key: u32) -> Result<Self, RingError> {
        let names = [
            paths::data_ready_name(key),
            paths::batch_complete_name(key),
            paths::wait_gate_name(key),
            paths::batch_generation_name(key),
        ];
        let opened = names
            .iter()
            .map(|name| NamedSemaphore::open(name, SemaphoreOptions::attach_only()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_handles(opened)
    }

    fn from_handles(handles: Vec<NamedSemaphore>) -> Result<Self, RingError> {
        let [data_ready, batch_complete, gate, generation]: [NamedSemaphore; 4] = handles
            .try_into()
            .map_err(|_| RingError::Protocol("incomplete coordination semaphore set".into()))?;
        Ok(Self {
            data_ready: Arc::new(data_ready),
            batch_complete: Arc::new(batch_complete),
            gate: Arc::new(gate),
            generation: Arc::new(generation),
        })
    }

    fn all(&self) -> [&Arc<NamedSemaphore>; 4] {
        [
            &self.data_ready,
            &self.batch_complete,
            &self.gate,
            &self.generation,
        ]
    }

    pub fn unlink(&self) -> Result<(), RingError> {
        let mut first_error = None;
        for sem in self.all() {
            match sem.unlink() {
                Ok(()) | Err(SemaphoreError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(semaphore = sem.name(), error = %e, "Failed to unlink coordination semaphore");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    pub fn close(self) -> Result<(), RingError> {
        let Self {
            data_ready,
            batch_complete,
            gate,
            generation,
        } = self;
        let mut first_error = None;
        for sem in [data_ready, batch_complete, gate, generation] {
            if let Err(e) = close_shared(sem) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}
