use std::cell::Cell;

/// Opaque identity of an OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadToken(u64);

impl ThreadToken {
    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Answers "which thread am I on".
///
/// `cached` may be stale or unavailable (thread-local storage is unreliable
/// while a thread is being torn down). `authoritative` must always be right.
pub trait ThreadIdentity: Send + Sync {
    fn cached(&self) -> Option<ThreadToken>;
    fn authoritative(&self) -> ThreadToken;

    #[inline]
    fn current(&self) -> ThreadToken {
        self.cached().unwrap_or_else(|| self.authoritative())
    }

    /// Cache first; on any mismatch ask the OS before answering no.
    #[inline]
    fn is_current(&self, token: ThreadToken) -> bool {
        if self.cached() == Some(token) {
            return true;
        }
        self.authoritative() == token
    }
}

#[cfg(unix)]
mod unix {
    unsafe extern "C" {
        pub fn pthread_self() -> usize;
    }
}

thread_local! {
    static CACHED_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// [`ThreadIdentity`] backed by `pthread_self` with a thread-local cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadIdentity;

impl OsThreadIdentity {
    #[inline]
    fn os_token() -> ThreadToken {
        // SAFETY: pthread_self has no preconditions
        ThreadToken(unsafe { unix::pthread_self() } as u64)
    }
}

impl ThreadIdentity for OsThreadIdentity {
    fn cached(&self) -> Option<ThreadToken> {
        CACHED_TOKEN
            .try_with(|cached| {
                let raw = cached.get();
                if raw != 0 {
                    return ThreadToken(raw);
                }
                let token = Self::os_token();
                cached.set(token.0);
                token
            })
            .ok()
    }

    fn authoritative(&self) -> ThreadToken {
        Self::os_token()
    }
}
