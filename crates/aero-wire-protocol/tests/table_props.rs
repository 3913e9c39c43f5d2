#![cfg(not(target_arch = "wasm32"))]

use std::collections::HashMap;

use aero_wire_protocol::{Lookup, ObjectHandle, ObjectTable};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    /// Frees the live object at this index (modulo the live count).
    Free(usize),
}

const MAX_OPS: usize = 256;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn dead_handles_never_resolve(ops in prop::collection::vec(op_strategy(), 1..MAX_OPS)) {
        let mut table = ObjectTable::new();
        let mut mirror = ObjectTable::new();
        let mut live: Vec<(ObjectHandle, u64)> = Vec::new();
        let mut dead: Vec<ObjectHandle> = Vec::new();
        let mut next_payload = 0u64;

        for op in ops {
            match op {
                Op::Allocate => {
                    let payload = next_payload;
                    next_payload += 1;
                    let handle = table.allocate(payload);
                    prop_assert!(!handle.is_null());
                    prop_assert_ne!(handle.generation, 0);
                    mirror.insert(handle, payload).expect("mirror stays in lockstep");
                    live.push((handle, payload));
                }
                Op::Free(idx) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (handle, payload) = live.swap_remove(idx % live.len());
                    prop_assert_eq!(table.free(handle), Ok(payload));
                    prop_assert_eq!(mirror.free(handle), Ok(payload));
                    dead.push(handle);
                }
            }

            // Every live handle resolves to its own payload and ids are unique.
            let mut ids = HashMap::new();
            for &(handle, payload) in &live {
                prop_assert_eq!(table.get(handle), Some(&payload));
                prop_assert_eq!(mirror.get(handle), Some(&payload));
                prop_assert!(ids.insert(handle.id, handle).is_none());
            }
            // A freed tenant never resolves, even after its id is reused.
            for &handle in &dead {
                prop_assert_eq!(table.get(handle), None);
                prop_assert_eq!(table.lookup(handle), Lookup::Stale);
            }
            prop_assert_eq!(table.len(), live.len());
        }
    }
}
