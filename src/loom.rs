#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code, unused_imports)]

    #[cfg(test)]
    pub(crate) use loom::model;
    pub(crate) use loom::thread;

    pub(crate) mod hint {
        /// Loom's scheduler is not obligated to preempt a spin loop, so
        /// pausing must be a yield point under the model.
        pub(crate) fn spin_loop() {
            loom::thread::yield_now()
        }
    }

    pub(crate) mod sync {
        use core::{
            fmt,
            ops::{Deref, DerefMut},
        };

        pub(crate) use loom::sync::{atomic, Arc};

        /// Mock version of the non-loom mutex below, backed by
        /// `loom::sync::Mutex`. The API differs slightly, since the real
        /// mutex does not surface poisoning.
        pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

        pub(crate) struct MutexGuard<'a, T>(loom::sync::MutexGuard<'a, T>);

        impl<T> Mutex<T> {
            #[track_caller]
            pub(crate) fn new(data: T) -> Self {
                Self(loom::sync::Mutex::new(data))
            }

            #[track_caller]
            pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                MutexGuard(self.0.lock().expect("loom mutex will never poison"))
            }
        }

        impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl<T> Deref for MutexGuard<'_, T> {
            type Target = T;
            #[inline]
            fn deref(&self) -> &Self::Target {
                self.0.deref()
            }
        }

        impl<T> DerefMut for MutexGuard<'_, T> {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                self.0.deref_mut()
            }
        }
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    #[cfg(test)]
    pub(crate) use std::thread;

    pub(crate) use portable_atomic::hint;

    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        let _trace = crate::util::test::trace_init();
        f()
    }

    pub(crate) mod sync {
        use core::{
            fmt,
            ops::{Deref, DerefMut},
        };

        pub(crate) use std::sync::Arc;

        pub(crate) mod atomic {
            pub(crate) use portable_atomic::*;
        }

        /// A `std::sync::Mutex` that treats poisoning the way the rest of
        /// this crate does: a panic while holding a slot mutex has already
        /// torn the protocol state, so waiting threads just keep going with
        /// whatever is there rather than cascading panics.
        pub(crate) struct Mutex<T>(std::sync::Mutex<T>);

        pub(crate) struct MutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

        impl<T> Mutex<T> {
            pub(crate) const fn new(data: T) -> Self {
                Self(std::sync::Mutex::new(data))
            }

            #[track_caller]
            pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                MutexGuard(self.0.lock().unwrap_or_else(|e| e.into_inner()))
            }
        }

        impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl<T> Deref for MutexGuard<'_, T> {
            type Target = T;
            #[inline]
            fn deref(&self) -> &Self::Target {
                self.0.deref()
            }
        }

        impl<T> DerefMut for MutexGuard<'_, T> {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                self.0.deref_mut()
            }
        }
    }
}
