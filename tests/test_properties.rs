//! Property tests for the release protocol and reference pinning

use native_bridge::binding::{AtomicPhase, Phase, Signal};
use native_bridge::lock::acquire;
use native_bridge::{KeptRef, KeptRefs, ManagedHeap, ManagedRuntime, Value};
use proptest::prelude::*;

fn signal() -> impl Strategy<Value = Signal> {
    prop_oneof![
        Just(Signal::Constructed),
        Just(Signal::ConstructionFailed),
        Just(Signal::Release),
        Just(Signal::Shutdown),
    ]
}

/// Reference model: two flags plus the construction outcome
#[derive(Debug, Default)]
struct Model {
    constructed: bool,
    failed: bool,
    released: bool,
    shut_down: bool,
}

impl Model {
    /// Whether `signal` is legal, applying it if so
    fn apply(&mut self, signal: Signal) -> bool {
        let open = self.constructed && !(self.released && self.shut_down);
        match signal {
            Signal::Constructed | Signal::ConstructionFailed if self.constructed || self.failed => false,
            Signal::Constructed => {
                self.constructed = true;
                true
            }
            Signal::ConstructionFailed => {
                self.failed = true;
                true
            }
            Signal::Release if open && !self.released => {
                self.released = true;
                true
            }
            Signal::Shutdown if open && !self.shut_down => {
                self.shut_down = true;
                true
            }
            Signal::Release | Signal::Shutdown => false,
        }
    }

    fn terminated(&self) -> bool {
        self.released && self.shut_down
    }
}

proptest! {
    #[test]
    fn prop_phase_matches_two_flag_model(signals in prop::collection::vec(signal(), 0..12)) {
        let mut model = Model::default();
        let mut phase = Phase::Constructing;

        for signal in signals {
            let legal = model.apply(signal);
            match phase.on(signal) {
                Ok(next) => {
                    prop_assert!(legal, "{phase:?} accepted illegal {signal:?}");
                    phase = next;
                }
                Err(violation) => {
                    prop_assert!(!legal, "{phase:?} rejected legal {signal:?}");
                    prop_assert_eq!(violation.phase, phase);
                    prop_assert_eq!(violation.signal, signal);
                }
            }
            prop_assert_eq!(phase == Phase::Terminated, model.terminated());
            prop_assert_eq!(phase == Phase::Failed, model.failed);
            prop_assert_eq!(phase.release_called(), model.released);
            prop_assert_eq!(phase.shutdown_called(), model.shut_down);
        }
    }

    #[test]
    fn prop_terminal_phases_absorb(signals in prop::collection::vec(signal(), 1..8)) {
        for start in [Phase::Terminated, Phase::Failed] {
            for signal in &signals {
                prop_assert!(start.on(*signal).is_err());
            }
        }
    }

    #[test]
    fn prop_exactly_one_terminal_observer(release_first in any::<bool>()) {
        let phase = AtomicPhase::new();
        phase.apply(Signal::Constructed).unwrap();
        let order = if release_first {
            [Signal::Release, Signal::Shutdown]
        } else {
            [Signal::Shutdown, Signal::Release]
        };
        let observed: Vec<bool> = order
            .iter()
            .map(|s| phase.apply(*s).unwrap().1.is_terminal())
            .collect();
        prop_assert_eq!(observed, vec![false, true]);
        prop_assert_eq!(phase.load(), Phase::Terminated);
    }

    #[test]
    fn prop_keep_release_restores_refcount(
        initial in 1usize..4,
        pins in prop::collection::vec(0usize..3, 0..16),
        drop_instead in any::<bool>(),
    ) {
        let heap = ManagedHeap::new();
        let lock = acquire(&*heap).unwrap();
        let objects: Vec<_> = (0..3).map(|i| heap.alloc(&lock, Value::Int(i))).collect();
        for obj in &objects {
            for _ in 1..initial {
                heap.incref(&lock, obj);
            }
        }

        let mut kept = Vec::new();
        for index in &pins {
            kept.push(KeptRef::keep(&heap, &lock, &objects[*index]));
        }
        for (index, obj) in objects.iter().enumerate() {
            let pinned = pins.iter().filter(|i| **i == index).count();
            prop_assert_eq!(heap.refcount(&lock, obj), initial + pinned);
        }

        if drop_instead {
            // Drop borrows the lock this thread already holds
            drop(kept);
        } else {
            for pin in kept {
                pin.release(&lock);
            }
        }
        for obj in &objects {
            prop_assert_eq!(heap.refcount(&lock, obj), initial);
        }
    }

    #[test]
    fn prop_kept_refs_release_all(roles in prop::collection::hash_set("[a-z]{1,6}", 0..6)) {
        let heap = ManagedHeap::new();
        let lock = acquire(&*heap).unwrap();
        let obj = heap.alloc(&lock, Value::None);
        let roles: Vec<&'static str> = roles.into_iter().map(|r| &*Box::leak(r.into_boxed_str())).collect();

        let mut refs = KeptRefs::new();
        for &role in &roles {
            refs.keep(&heap, &lock, role, &obj);
        }
        prop_assert_eq!(refs.len(), roles.len());
        prop_assert_eq!(heap.refcount(&lock, &obj), 1 + roles.len());
        for &role in &roles {
            prop_assert_eq!(refs.get(role), Some(&obj));
        }

        refs.release_all(&lock);
        prop_assert!(refs.is_empty());
        prop_assert_eq!(heap.refcount(&lock, &obj), 1);
    }
}

#[test]
fn test_unpinned_object_is_collected() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::from("x"));
    let kept = KeptRef::keep(&heap, &lock, &obj);
    heap.decref(&lock, obj);
    assert!(heap.is_live(obj));
    kept.release(&lock);
    assert!(!heap.is_live(obj));
}
