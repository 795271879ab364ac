use crate::errors::RingError;
use crate::paths;
use crate::region::SharedRegion;
use crate::semaphore::{NamedSemaphore, SemaphoreError, SemaphoreOptions};
use std::sync::Arc;

/// One named span of a fixed binary layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: usize, size: usize) -> Self {
        Self { name, offset, size }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Fixed layout over a shared region with one named semaphore per field.
///
/// Lock handles live in a registry owned by the manager, parallel to the
/// layout. Several fields are always locked in layout order, which is the
/// global order every participant uses, so multi-field acquisitions cannot
/// deadlock against each other.
pub struct FieldManager {
    region: Arc<SharedRegion>,
    layout: &'static [FieldSpec],
    locks: Vec<NamedSemaphore>,
}

impl FieldManager {
    /// Open (or create, depending on `options`) the lock of every field.
    ///
    /// A failed exclusive create removes the locks this call already created.
    pub fn new(
        region: Arc<SharedRegion>,
        layout: &'static [FieldSpec],
        prefix: &str,
        options: SemaphoreOptions,
    ) -> Result<Self, RingError> {
        for field in layout {
            if field.end() > region.len() {
                return Err(RingError::OutOfBounds {
                    offset: field.offset,
                    len: field.size,
                    size: region.len(),
                });
            }
        }

        let mut locks = Vec::with_capacity(layout.len());
        for field in layout {
            let name = paths::field_lock_name(prefix, field.name);
            match NamedSemaphore::open(&name, options) {
                Ok(lock) => locks.push(lock),
                Err(e) => {
                    if options.create && !options.exist_ok {
                        for lock in &locks {
                            let _ = lock.unlink();
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            region,
            layout,
            locks,
        })
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn layout(&self) -> &'static [FieldSpec] {
        self.layout
    }

    fn index_of(&self, field: &str) -> Result<usize, RingError> {
        self.layout
            .iter()
            .position(|spec| spec.name == field)
            .ok_or_else(|| RingError::UnknownField(field.to_string()))
    }

    fn lock_at(&self, index: usize) -> Result<FieldGuard<'_>, RingError> {
        self.locks[index].wait()?;
        Ok(FieldGuard {
            manager: self,
            index,
            held: true,
        })
    }

    /// Block until the field's lock is held. The guard releases it on drop.
    ///
    /// This is a blocking `sem_wait`, also when called from async code. Field
    /// locks are held only for a few copies out of the mapping and never
    /// across an `.await`, so the wait is bounded by another holder's copy.
    /// Unbounded waits (data-ready, batch-complete, the wait gate) go through
    /// `NamedSemaphore::wait_async` or `spawn_blocking` instead.
    pub fn acquire(&self, field: &str) -> Result<FieldGuard<'_>, RingError> {
        let index = self.index_of(field)?;
        self.lock_at(index)
    }

    /// Lock several fields in layout order. Duplicates are locked once.
    pub fn acquire_multiple(&self, fields: &[&str]) -> Result<FieldGuards<'_>, RingError> {
        let mut indices = fields
            .iter()
            .map(|field| self.index_of(field))
            .collect::<Result<Vec<_>, _>>()?;
        indices.sort_unstable();
        indices.dedup();

        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            // Guards already taken are released by drop if this fails
            guards.push(self.lock_at(index)?);
        }
        Ok(FieldGuards { guards })
    }

    pub fn get_value(&self, field: &str) -> Result<u64, RingError> {
        let guard = self.acquire(field)?;
        let value = guard.get_value()?;
        guard.release()?;
        Ok(value)
    }

    pub fn set_value(&self, field: &str, value: u64) -> Result<(), RingError> {
        let guard = self.acquire(field)?;
        guard.set_value(value)?;
        guard.release()
    }

    pub fn get_sequence(&self, field: &str) -> Result<Vec<u8>, RingError> {
        let guard = self.acquire(field)?;
        let bytes = guard.get_sequence()?;
        guard.release()?;
        Ok(bytes)
    }

    pub fn set_sequence(&self, field: &str, bytes: &[u8]) -> Result<(), RingError> {
        let guard = self.acquire(field)?;
        guard.set_sequence(bytes)?;
        guard.release()
    }

    /// Remove every lock name system-wide. Handles stay open.
    pub fn unlink(&self) -> Result<(), RingError> {
        let mut first_error = None;
        for lock in &self.locks {
            match lock.unlink() {
                Ok(()) | Err(SemaphoreError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(semaphore = lock.name(), error = %e, "Failed to unlink field lock");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Close this process's lock handles.
    pub fn close(self) -> Result<(), RingError> {
        let mut first_error = None;
        for lock in self.locks {
            if let Err(e) = lock.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}

/// A held field lock with raw accessors for the locked field.
pub struct FieldGuard<'a> {
    manager: &'a FieldManager,
    index: usize,
    held: bool,
}

impl FieldGuard<'_> {
    pub fn field(&self) -> &'static FieldSpec {
        let layout: &'static [FieldSpec] = self.manager.layout;
        &layout[self.index]
    }

    /// Read the field as a little-endian u64. The field must be 8 bytes.
    pub fn get_value(&self) -> Result<u64, RingError> {
        let spec = self.value_spec()?;
        let mut buf = [0u8; 8];
        self.manager.region.read_into(spec.offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn set_value(&self, value: u64) -> Result<(), RingError> {
        let spec = self.value_spec()?;
        self.manager.region.write(&value.to_le_bytes(), spec.offset)
    }

    pub fn get_sequence(&self) -> Result<Vec<u8>, RingError> {
        let spec = self.field();
        self.manager.region.read(spec.size, spec.offset)
    }

    /// Overwrite the whole field. `bytes` must be exactly the field size.
    pub fn set_sequence(&self, bytes: &[u8]) -> Result<(), RingError> {
        let spec = self.field();
        if bytes.len() != spec.size {
            return Err(RingError::FieldSize {
                field: spec.name,
                expected: spec.size,
                actual: bytes.len(),
            });
        }
        self.manager.region.write(bytes, spec.offset)
    }

    fn value_spec(&self) -> Result<&'static FieldSpec, RingError> {
        let spec = self.field();
        if spec.size != 8 {
            return Err(RingError::FieldSize {
                field: spec.name,
                expected: 8,
                actual: spec.size,
            });
        }
        Ok(spec)
    }

    /// Release the lock, surfacing a failed post.
    pub fn release(mut self) -> Result<(), RingError> {
        self.held = false;
        self.manager.locks[self.index].post()?;
        Ok(())
    }
}

impl Drop for FieldGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            let lock = &self.manager.locks[self.index];
            if let Err(e) = lock.post() {
                tracing::error!(semaphore = lock.name(), error = %e, "Failed to release field lock");
            }
        }
    }
}

/// Locks taken together by `FieldManager::acquire_multiple`.
pub struct FieldGuards<'a> {
    guards: Vec<FieldGuard<'a>>,
}

impl<'a> FieldGuards<'a> {
    pub fn get(&self, field: &str) -> Result<&FieldGuard<'a>, RingError> {
        self.guards
            .iter()
            .find(|guard| guard.field().name == field)
            .ok_or_else(|| RingError::UnknownField(field.to_string()))
    }

    pub fn value(&self, field: &str) -> Result<u64, RingError> {
        self.get(field)?.get_value()
    }

    pub fn set_value(&self, field: &str, value: u64) -> Result<(), RingError> {
        self.get(field)?.set_value(value)
    }

    pub fn release(self) -> Result<(), RingError> {
        let mut result = Ok(());
        for guard in self.guards {
            if let Err(e) = guard.release() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionOptions;

    static LAYOUT: [FieldSpec; 3] = [
        FieldSpec::new("tag", 0, 4),
        FieldSpec::new("count", 4, 8),
        FieldSpec::new("total", 12, 8),
    ];

    struct Fixture {
        key: u32,
        prefix: String,
        manager: Option<FieldManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let key = crate::test_key();
            let prefix = format!("fieldtest{key}");
            for field in &LAYOUT {
                let _ = NamedSemaphore::maybe_unlink(&paths::field_lock_name(&prefix, field.name));
            }
            let _ = SharedRegion::maybe_destroy(key);

            let region = Arc::new(SharedRegion::create(key, 32, RegionOptions::default()).unwrap());
            let manager =
                FieldManager::new(region, &LAYOUT, &prefix, SemaphoreOptions::exclusive(1))
                    .unwrap();
            Self {
                key,
                prefix,
                manager: Some(manager),
            }
        }

        fn manager(&self) -> &FieldManager {
            self.manager.as_ref().unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(manager) = self.manager.take() {
                let _ = manager.unlink();
                let _ = manager.close();
            }
            let _ = SharedRegion::maybe_destroy(self.key);
        }
    }

    #[test]
    fn test_value_roundtrip_is_little_endian() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        manager.set_value("count", 0x0102_0304).unwrap();
        assert_eq!(manager.get_value("count").unwrap(), 0x0102_0304);

        let raw = manager.region().read(8, 4).unwrap();
        assert_eq!(raw, 0x0102_0304u64.to_le_bytes());
    }

    #[test]
    fn test_sequence_requires_exact_size() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        manager.set_sequence("tag", b"ABCD").unwrap();
        assert_eq!(manager.get_sequence("tag").unwrap(), b"ABCD");

        assert!(matches!(
            manager.set_sequence("tag", b"ABC"),
            Err(RingError::FieldSize {
                expected: 4,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_value_access_on_short_field_is_rejected() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.manager().get_value("tag"),
            Err(RingError::FieldSize { .. })
        ));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.manager().acquire("missing"),
            Err(RingError::UnknownField(_))
        ));
    }

    #[test]
    fn test_guard_releases_lock_on_drop() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        {
            let guard = manager.acquire("count").unwrap();
            guard.set_value(7).unwrap();
        }

        // Would block forever if the drop above had not posted the lock
        assert_eq!(manager.get_value("count").unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inline_locking_from_async_tasks_makes_progress() {
        let fixture = Arc::new(Fixture::new());
        fixture.manager().set_value("count", 0).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let fixture = Arc::clone(&fixture);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        {
                            let guard = fixture.manager().acquire("count").unwrap();
                            let value = guard.get_value().unwrap();
                            guard.set_value(value + 1).unwrap();
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let all = futures::future::join_all(tasks);
        let results = tokio::time::timeout(std::time::Duration::from_secs(10), all)
            .await
            .expect("Short field critical sections must not stall the runtime");
        for result in results {
            result.unwrap();
        }

        assert_eq!(fixture.manager().get_value("count").unwrap(), 800);
    }

    #[test]
    fn test_acquire_multiple_shares_one_critical_section() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let guards = manager.acquire_multiple(&["total", "count", "total"]).unwrap();
        guards.set_value("count", 3).unwrap();
        guards.set_value("total", 9).unwrap();
        assert_eq!(guards.value("count").unwrap(), 3);
        assert!(
            guards.get("tag").is_err(),
            "Only requested fields should be held"
        );
        guards.release().unwrap();

        assert_eq!(manager.get_value("total").unwrap(), 9);
    }

    #[test]
    fn test_attach_only_manager_sees_same_locks() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let attached = FieldManager::new(
            Arc::new(SharedRegion::attach(fixture.key, 32).unwrap()),
            &LAYOUT,
            &fixture.prefix,
            SemaphoreOptions::attach_only(),
        )
        .unwrap();

        let guard = manager.acquire("count").unwrap();
        guard.set_value(11).unwrap();
        assert!(
            !attached.locks[1].try_wait().unwrap(),
            "Lock held by one manager must be visible to the other"
        );
        guard.release().unwrap();

        assert_eq!(attached.get_value("count").unwrap(), 11);
        attached.close().unwrap();
    }

    #[test]
    fn test_second_exclusive_manager_fails_and_keeps_existing_locks() {
        let fixture = Fixture::new();

        let second = FieldManager::new(
            Arc::clone(fixture.manager().region()),
            &LAYOUT,
            &fixture.prefix,
            SemaphoreOptions::exclusive(1),
        );
        assert!(matches!(
            second,
            Err(RingError::Semaphore(SemaphoreError::AlreadyExists { .. }))
        ));

        // The failed create must not have touched the first manager's locks
        fixture.manager().set_value("count", 1).unwrap();
    }

    #[test]
    fn test_layout_outside_region_is_rejected() {
        static WIDE: [FieldSpec; 1] = [FieldSpec::new("wide", 30, 8)];
        let fixture = Fixture::new();

        let result = FieldManager::new(
            Arc::clone(fixture.manager().region()),
            &WIDE,
            &fixture.prefix,
            SemaphoreOptions::default(),
        );
        assert!(matches!(result, Err(RingError::OutOfBounds { .. })));
    }
}
