//! Internal utilities.

#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(test)]
pub(crate) mod test {
    /// A guard holding the tracing default-subscriber registration for the
    /// duration of a test.
    #[must_use]
    #[cfg(not(loom))]
    pub(crate) struct TestGuard {
        _x1: tracing::subscriber::DefaultGuard,
    }

    /// Initialize tracing with a default filter directive.
    #[cfg(not(loom))]
    pub(crate) fn trace_init() -> TestGuard {
        use tracing_subscriber::{
            filter::{EnvFilter, LevelFilter},
        };

        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
        let filter = if env.is_empty() {
            builder.parse("hyphae_sync=debug").unwrap()
        } else {
            builder.parse_lossy(env)
        };
        let collector = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .finish();

        TestGuard {
            _x1: tracing::subscriber::set_default(collector),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn assert_send_sync<T: Send + Sync>() {}
}
