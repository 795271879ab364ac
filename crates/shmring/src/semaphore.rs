use nix::errno::Errno;
use nix::libc;
use std::ffi::CString;
use std::os::raw::{c_int, c_uint};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("Semaphore {name} already exists")]
    AlreadyExists { name: String },
    #[error("Semaphore {name} does not exist")]
    NotFound { name: String },
    #[error("Failed to open semaphore {name}: {source}")]
    OpenFailed { name: String, source: Errno },
    #[error("Semaphore {op} failed on {name}: {source}")]
    OperationFailed {
        op: &'static str,
        name: String,
        source: Errno,
    },
    #[error("Invalid semaphore name")]
    InvalidName,
    #[error("Blocking semaphore task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How a named semaphore is opened.
///
/// `create && !exist_ok` is an exclusive create: it fails when the name is
/// already taken, which is how the writer proves it is the sole initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreOptions {
    pub create: bool,
    pub exist_ok: bool,
    pub initial_value: u32,
    pub permissions: u32,
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            create: true,
            exist_ok: true,
            initial_value: 1,
            permissions: 0o666,
        }
    }
}

impl SemaphoreOptions {
    pub fn exclusive(initial_value: u32) -> Self {
        Self {
            create: true,
            exist_ok: false,
            initial_value,
            ..Self::default()
        }
    }

    pub fn attach_only() -> Self {
        Self {
            create: false,
            ..Self::default()
        }
    }

    fn flags(&self) -> c_int {
        let mut flags = 0;
        if self.create {
            flags |= libc::O_CREAT;
            if !self.exist_ok {
                flags |= libc::O_EXCL;
            }
        }
        flags
    }
}

/// Process-shared POSIX counting semaphore identified by name.
///
/// Dropping the handle closes it; `unlink` is global and must only be called
/// by the party that owns the name.
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

impl NamedSemaphore {
    pub fn open(name: &str, options: SemaphoreOptions) -> Result<Self, SemaphoreError> {
        let c_name = os_name(name)?;

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                options.flags(),
                options.permissions as c_uint,
                options.initial_value as c_uint,
            )
        };

        if sem == libc::SEM_FAILED {
            let errno = Errno::last();
            return Err(match errno {
                Errno::EEXIST => SemaphoreError::AlreadyExists {
                    name: name.to_string(),
                },
                Errno::ENOENT => SemaphoreError::NotFound {
                    name: name.to_string(),
                },
                source => SemaphoreError::OpenFailed {
                    name: name.to_string(),
                    source,
                },
            });
        }

        tracing::debug!(semaphore = name, ?options, "Semaphore opened");
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block the calling thread until the count is positive, then decrement.
    pub fn wait(&self) -> Result<(), SemaphoreError> {
        loop {
            let ret = unsafe { libc::sem_wait(self.sem) };
            if ret == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                source => return Err(self.failed("wait", source)),
            }
        }
    }

    /// Same as `wait`, but parked on the blocking pool so other tasks of this
    /// process keep running.
    pub async fn wait_async(self: &Arc<Self>) -> Result<(), SemaphoreError> {
        let sem = Arc::clone(self);
        tokio::task::spawn_blocking(move || sem.wait()).await?
    }

    pub fn try_wait(&self) -> Result<bool, SemaphoreError> {
        let ret = unsafe { libc::sem_trywait(self.sem) };
        if ret == 0 {
            Ok(true)
        } else {
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                Ok(false)
            } else {
                Err(self.failed("trywait", errno))
            }
        }
    }

    pub fn post(&self) -> Result<(), SemaphoreError> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(self.failed("post", Errno::last()));
        }
        Ok(())
    }

    pub fn value(&self) -> Result<u64, SemaphoreError> {
        let mut val: c_int = 0;
        let ret = unsafe { libc::sem_getvalue(self.sem, &mut val) };
        if ret != 0 {
            return Err(self.failed("getvalue", Errno::last()));
        }
        // Linux reports 0 rather than a negative waiter count.
        Ok(val.max(0) as u64)
    }

    /// Release this process's handle.
    pub fn close(mut self) -> Result<(), SemaphoreError> {
        let sem = std::mem::replace(&mut self.sem, std::ptr::null_mut());
        let ret = unsafe { libc::sem_close(sem) };
        if ret != 0 {
            return Err(self.failed("close", Errno::last()));
        }
        Ok(())
    }

    /// Remove the name system-wide. Open handles stay usable until closed.
    pub fn unlink(&self) -> Result<(), SemaphoreError> {
        Self::unlink_name(&self.name)
    }

    pub fn unlink_name(name: &str) -> Result<(), SemaphoreError> {
        let c_name = os_name(name)?;
        let ret = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if ret != 0 {
            return Err(match Errno::last() {
                Errno::ENOENT => SemaphoreError::NotFound {
                    name: name.to_string(),
                },
                source => SemaphoreError::OperationFailed {
                    op: "unlink",
                    name: name.to_string(),
                    source,
                },
            });
        }
        Ok(())
    }

    /// Best-effort unlink for cleanup paths: a missing name counts as success.
    /// Returns whether something was removed.
    pub fn maybe_unlink(name: &str) -> Result<bool, SemaphoreError> {
        match Self::unlink_name(name) {
            Ok(()) => {
                tracing::info!(semaphore = name, "Unlinked semaphore");
                Ok(true)
            }
            Err(SemaphoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn failed(&self, op: &'static str, source: Errno) -> SemaphoreError {
        SemaphoreError::OperationFailed {
            op,
            name: self.name.clone(),
            source,
        }
    }
}

/// Close a handle that may still be shared with in-flight blocking tasks.
/// When other clones are alive the handle is closed by the last drop instead.
pub fn close_shared(sem: Arc<NamedSemaphore>) -> Result<(), SemaphoreError> {
    match Arc::try_unwrap(sem) {
        Ok(sem) => sem.close(),
        Err(shared) => {
            tracing::debug!(
                semaphore = shared.name(),
                "Semaphore still referenced, deferring close to drop"
            );
            Ok(())
        }
    }
}

fn os_name(name: &str) -> Result<CString, SemaphoreError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') {
        return Err(SemaphoreError::InvalidName);
    }
    CString::new(format!("/{bare}")).map_err(|_| SemaphoreError::InvalidName)
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if !self.sem.is_null() {
            unsafe {
                libc::sem_close(self.sem);
            }
        }
    }
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}
