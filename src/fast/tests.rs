use super::*;

#[cfg(not(loom))]
mod sequential {
    use super::*;
    use crate::event::EventPoll;
    use crate::net::NodeId;
    use crate::runtime::Config;
    use crate::sim::{Loopback, SimEvents};

    fn sim_node(config: Config) -> (Arc<SimEvents>, Loopback, crate::runtime::Node) {
        let events = Arc::new(SimEvents::new());
        let net = Loopback::new();
        let node = net.join_with_config(NodeId::new(0), events.clone(), config);
        (events, net, node)
    }

    #[test]
    fn lock_is_send_sync() {
        crate::util::test::assert_send_sync::<FastReservation>();
        crate::util::test::assert_send_sync::<crate::runtime::Node>();
    }

    #[test]
    fn uncontended_write() {
        let fast = FastReservation::new();
        assert!(!fast.wrlock(WaitMode::Spin).exists());
        assert!(!fast.trywrlock(), "writers exclude writers");
        assert!(!fast.tryrdlock(), "writers exclude readers");
        fast.unlock();
        assert!(fast.trywrlock());
        fast.unlock();
    }

    #[test]
    fn readers_share() {
        let fast = FastReservation::new();
        assert!(!fast.rdlock(WaitMode::Spin).exists());
        assert!(!fast.rdlock(WaitMode::Spin).exists());
        assert!(fast.tryrdlock());
        assert!(!fast.trywrlock(), "readers exclude writers");
        fast.unlock();
        fast.unlock();
        assert!(!fast.trywrlock(), "one reader is still inside");
        fast.unlock();
        assert!(fast.trywrlock());
        fast.unlock();
    }

    #[test]
    fn contended_writer_spins_through() {
        let _trace = crate::util::test::trace_init();
        let fast = Arc::new(FastReservation::new());
        assert!(!fast.rdlock(WaitMode::Spin).exists());

        let writer = {
            let fast = fast.clone();
            crate::loom::thread::spawn(move || {
                assert!(!fast.wrlock(WaitMode::Spin).exists());
                fast.unlock();
            })
        };

        // Give the writer a moment to start spinning (and, likely, set the
        // reader throttle), then get out of its way.
        std::thread::sleep(std::time::Duration::from_millis(10));
        fast.unlock();
        writer.join().expect("writer thread mustn't panic");

        assert!(fast.trywrlock());
        fast.unlock();
    }

    #[test]
    fn base_rsrv_granted_immediately_when_free() {
        let _trace = crate::util::test::trace_init();
        let (_events, _net, node) = sim_node(Config::default());
        let base = node.create_reservation(0);
        let fast = node.fast_reservation(Some(base));

        // The base reservation starts out owning the lock, but it is free,
        // so the first lock attempt gets it right away.
        assert!(!fast.rdlock(WaitMode::Wait).exists());
        assert!(!fast.trywrlock());
        fast.unlock();
        assert!(fast.trywrlock());
        fast.unlock();

        drop(fast);
        node.destroy_reservation(base, crate::event::Event::NONE);
    }

    #[test]
    fn base_rsrv_held_elsewhere() {
        let _trace = crate::util::test::trace_init();
        let (events, _net, node) = sim_node(Config::default());
        let base = node.create_reservation(0);

        // Somebody else holds the base reservation when the fast lock is
        // built over it.
        assert!(!node
            .acquire(base, crate::rsrv::Mode::new(0), true, Event::NONE)
            .exists());
        let fast = node.fast_reservation(Some(base));

        let ready = fast.rdlock(WaitMode::Wait);
        assert!(ready.exists(), "the base acquire has to wait");
        assert_eq!(events.poll(ready), EventPoll::Pending);
        assert!(!fast.tryrdlock(), "still waiting on the base reservation");

        node.release(base, Event::NONE);
        assert_eq!(events.poll(ready), EventPoll::Triggered);

        // Wait satisfied; the retry gets the lock.
        assert!(!fast.rdlock(WaitMode::Wait).exists());
        assert!(!fast.trywrlock());
        fast.unlock();
        assert!(fast.trywrlock());
        fast.unlock();
    }

    #[test]
    fn base_rsrv_asked_back() {
        let _trace = crate::util::test::trace_init();
        let (_events, _net, node) = sim_node(Config::default());
        let base = node.create_reservation(0);
        let fast = node.fast_reservation(Some(base));

        assert!(!fast.rdlock(WaitMode::Wait).exists());
        assert!(!node.is_locked(base, crate::rsrv::Mode::new(0), true));
        // The fast lock holds the base grant now; flag that the remote side
        // wants it back.
        fast.state.fetch_add(BASE_RSRV_WAITING);

        // The last unlock hands the grant back and reinstates BASE_RSRV.
        fast.unlock();
        let state = fast.state.load(Relaxed);
        assert!(state & BASE_RSRV != 0);
        assert!(state & BASE_RSRV_WAITING == 0);
        assert_eq!(state & READERS_MASK, 0);

        // Locking again just re-requests the (free) base reservation.
        assert!(!fast.rdlock(WaitMode::Wait).exists());
        fast.unlock();
    }

    #[test]
    fn sleep_advice() {
        let _trace = crate::util::test::trace_init();
        let (events, _net, node) = sim_node(Config::default());
        let fast = node.fast_reservation(None);

        assert!(!fast.rdlock(WaitMode::Wait).exists());
        let guard = events.create();
        fast.advise_sleep_entry(guard);

        // Readers tolerate a sleeper; writers must wait it out.
        assert!(fast.tryrdlock());
        fast.unlock();
        assert!(!fast.trywrlock());
        let wait_for = fast.wrlock(WaitMode::Wait);
        assert_eq!(wait_for, guard, "writers wait on the sleeper's guard");

        // A second sleeper merges its guard with the first.
        let guard2 = events.create();
        fast.advise_sleep_entry(guard2);
        let merged = fast.wrlock(WaitMode::Wait);
        assert!(merged.exists());
        assert_ne!(merged, guard);

        fast.advise_sleep_exit();
        fast.advise_sleep_exit();
        assert!(fast.state.load(Relaxed) & SLEEPER == 0);

        fast.unlock();
        assert!(fast.trywrlock());
        fast.unlock();
    }

    #[test]
    fn slow_fallback_routes_through_the_reservation() {
        let _trace = crate::util::test::trace_init();
        let (_events, _net, node) = sim_node(Config {
            use_fast_reservation_fallback: true,
        });

        // No base supplied: fallback mode allocates its own.
        let fast = node.fast_reservation(None);
        assert!(fast.state.load(Relaxed) & SLOW_FALLBACK != 0);

        assert!(!fast.wrlock(WaitMode::Wait).exists());
        // The state word is untouched in fallback mode; the reservation is
        // what is held.
        assert_eq!(fast.state.load(Relaxed) & (READERS_MASK | WRITER), 0);

        // A contended try fails through the nonblocking path and records a
        // retry to pay back.
        assert!(!fast.trywrlock());
        assert_eq!(FALLBACK_RETRIES.load(Relaxed), 1);

        fast.unlock();

        // The next acquire is issued as the paired retry and drains the
        // counter, leaving the reservation migratable again.
        assert!(!fast.wrlock(WaitMode::Wait).exists());
        assert_eq!(FALLBACK_RETRIES.load(Relaxed), 0);
        fast.unlock();

        assert!(fast.tryrdlock());
        fast.unlock();
    }
}

#[cfg(loom)]
mod models {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};
    use ::loom::cell::UnsafeCell;

    #[test]
    fn trywrlock_is_exclusive() {
        loom::model(|| {
            let lock = Arc::new(FastReservation::new());
            let data = Arc::new(UnsafeCell::new(0usize));

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let lock = lock.clone();
                    let data = data.clone();
                    thread::spawn(move || loop {
                        if lock.trywrlock() {
                            data.with_mut(|p| unsafe { *p += 1 });
                            lock.unlock();
                            break;
                        }
                        ::loom::thread::yield_now();
                    })
                })
                .collect();

            for t in threads {
                t.join().expect("writer thread mustn't panic");
            }

            assert!(lock.trywrlock());
            data.with(|p| assert_eq!(unsafe { *p }, 2));
            lock.unlock();
        });
    }

    #[test]
    fn readers_and_writer_do_not_race() {
        loom::model(|| {
            let lock = Arc::new(FastReservation::new());
            let data = Arc::new(UnsafeCell::new(0usize));

            let writer = {
                let lock = lock.clone();
                let data = data.clone();
                thread::spawn(move || loop {
                    if lock.trywrlock() {
                        data.with_mut(|p| unsafe { *p += 1 });
                        lock.unlock();
                        break;
                    }
                    ::loom::thread::yield_now();
                })
            };

            let reader = {
                let lock = lock.clone();
                let data = data.clone();
                thread::spawn(move || loop {
                    if lock.tryrdlock() {
                        let read = data.with(|p| unsafe { *p });
                        assert!(read <= 1);
                        lock.unlock();
                        break;
                    }
                    ::loom::thread::yield_now();
                })
            };

            writer.join().expect("writer thread mustn't panic");
            reader.join().expect("reader thread mustn't panic");
        });
    }

    #[test]
    fn wrlock_spin_is_exclusive() {
        loom::model(|| {
            let lock = Arc::new(FastReservation::new());
            let data = Arc::new(UnsafeCell::new(0usize));

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let lock = lock.clone();
                    let data = data.clone();
                    thread::spawn(move || {
                        assert!(!lock.wrlock(WaitMode::Spin).exists());
                        data.with_mut(|p| unsafe { *p += 1 });
                        lock.unlock();
                    })
                })
                .collect();

            for t in threads {
                t.join().expect("writer thread mustn't panic");
            }

            data.with(|p| assert_eq!(unsafe { *p }, 2));
        });
    }
}
