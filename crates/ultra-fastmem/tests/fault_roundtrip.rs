//! End-to-end fault resolution: raw host accesses into uncommitted arena
//! pages must route through the registered access object and resume.

#![cfg(all(
    target_os = "linux",
    target_pointer_width = "64",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use ultra_fastmem::{FastMem, FastMemError, FaultAccess, FaultRecord};

const LOAD_PATTERN: u64 = 0x1122_3344_5566_7788;

#[derive(Default)]
struct ProbeState {
    loads: AtomicU32,
    store_addr: AtomicU32,
    store_width: AtomicU32,
    store_value: AtomicU64,
}

/// Answers loads with a fixed pattern and records the last store. Uses only
/// atomics: this runs in signal context.
struct Probe {
    state: Arc<ProbeState>,
}

impl FaultAccess for Probe {
    fn load(&mut self, _paddr: u32, width: u32) -> Option<u64> {
        self.state.loads.fetch_add(1, Ordering::Relaxed);
        let mask = if width >= 8 {
            u64::MAX
        } else {
            (1 << (width * 8)) - 1
        };
        Some(LOAD_PATTERN & mask)
    }

    fn store(&mut self, paddr: u32, width: u32, value: u64) -> bool {
        self.state.store_addr.store(paddr, Ordering::Relaxed);
        self.state.store_width.store(width, Ordering::Relaxed);
        self.state.store_value.store(value, Ordering::Relaxed);
        true
    }
}

// One test function: the registration and the signal disposition are
// process-wide state.
#[test]
fn faults_route_through_the_access_object() {
    let mut fm = match FastMem::new() {
        Ok(fm) => fm,
        // Host page size rules fault-driven memory out; nothing to test.
        Err(FastMemError::Unsupported) => return,
        Err(e) => panic!("arena setup failed: {e}"),
    };

    fm.arena().commit(0x0000_1000, 0x1000).unwrap();
    let ram = fm.arena().ptr_at(0x0000_1500);
    let mmio = fm.arena().ptr_at(0x0430_0000);

    let state = Arc::new(ProbeState::default());
    fm.register(Box::new(Probe {
        state: state.clone(),
    }))
    .unwrap();

    // A second registration through the same handle is refused.
    assert!(matches!(
        fm.register(Box::new(Probe {
            state: state.clone()
        })),
        Err(FastMemError::AlreadyRegistered)
    ));

    unsafe {
        // Committed pages are plain memory and never reach the probe.
        ptr::write_volatile(ram.cast::<u32>(), 0x0BAD_F00D);
        assert_eq!(ptr::read_volatile(ram.cast::<u32>()), 0x0BAD_F00D);
        assert_eq!(state.loads.load(Ordering::Relaxed), 0);
        assert_eq!(fm.last_fault(), None);

        // A store into an uncommitted page faults and is serviced.
        ptr::write_volatile(mmio.cast::<u32>(), 0xDEAD_BEEF);
        assert_eq!(state.store_addr.load(Ordering::Relaxed), 0x0430_0000);
        assert_eq!(state.store_width.load(Ordering::Relaxed), 4);
        assert_eq!(state.store_value.load(Ordering::Relaxed), 0xDEAD_BEEF);
        assert_eq!(
            fm.last_fault(),
            Some(FaultRecord {
                paddr: 0x0430_0000,
                width: 4,
                store: true
            })
        );

        // Loads come back from the probe, sized correctly.
        assert_eq!(ptr::read_volatile(mmio.cast::<u32>()), 0x5566_7788);
        assert_eq!(ptr::read_volatile(mmio.cast::<u8>()), 0x88);
        assert_eq!(
            ptr::read_volatile(mmio.cast::<u64>()),
            0x1122_3344_5566_7788
        );
        assert!(state.loads.load(Ordering::Relaxed) >= 3);

        // Narrow store.
        ptr::write_volatile(mmio.add(2).cast::<u16>(), 0xBEEF);
        assert_eq!(state.store_addr.load(Ordering::Relaxed), 0x0430_0002);
        assert_eq!(state.store_width.load(Ordering::Relaxed), 2);
        assert_eq!(state.store_value.load(Ordering::Relaxed), 0xBEEF);
    }

    fm.clear_last_fault();
    assert_eq!(fm.last_fault(), None);
}
