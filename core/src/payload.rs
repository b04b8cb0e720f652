//! Branch payloads and the deterministic merge.
//!
//! A payload is an opaque JSON object supplied by a branch. When every
//! expected branch has reported, the barrier folds the stored payloads into a
//! single merged payload:
//!
//! - shallow union of the top-level fields of every branch payload,
//! - on collision, the branch listed earlier in the workflow's priority order wins,
//! - [`READY_MARKER`] is set to `true` last and always wins.
//!
//! `serde_json::Map` is key-sorted, so the serialized merge is byte-identical
//! regardless of the order branches arrived in.

use crate::correlation::BranchTag;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Opaque structured value reported by a branch.
pub type Payload = Map<String, Value>;

/// Field added to every merged payload to signal the next stage may proceed.
pub const READY_MARKER: &str = "readyForNextStage";

/// Merge arrived branch payloads in priority order.
///
/// `priority` lists branch tags from highest to lowest precedence. Tags in
/// `arrived` that are missing from `priority` are ignored; the barrier never
/// records such tags.
///
/// # Example
///
/// ```
/// use fanin_core::correlation::BranchTag;
/// use fanin_core::payload::{merge_payloads, Payload, READY_MARKER};
/// use serde_json::json;
/// use std::collections::BTreeMap;
///
/// let order: Payload = json!({"orderId": "o-1", "amount": 100}).as_object().cloned().unwrap();
/// let stock: Payload = json!({"orderId": "o-1", "allAvailable": true}).as_object().cloned().unwrap();
///
/// let mut arrived = BTreeMap::new();
/// arrived.insert(BranchTag::new("order.validated"), order);
/// arrived.insert(BranchTag::new("inventory.checked"), stock);
///
/// let priority = [BranchTag::new("inventory.checked"), BranchTag::new("order.validated")];
/// let merged = merge_payloads(&arrived, &priority);
///
/// assert_eq!(merged["amount"], json!(100));
/// assert_eq!(merged["allAvailable"], json!(true));
/// assert_eq!(merged[READY_MARKER], json!(true));
/// ```
#[must_use]
pub fn merge_payloads(arrived: &BTreeMap<BranchTag, Payload>, priority: &[BranchTag]) -> Payload {
    let mut merged = Payload::new();

    for tag in priority {
        let Some(payload) = arrived.get(tag) else {
            continue;
        };
        for (field, value) in payload {
            if !merged.contains_key(field) {
                merged.insert(field.clone(), value.clone());
            }
        }
    }

    merged.insert(READY_MARKER.to_string(), Value::Bool(true));
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn priority() -> Vec<BranchTag> {
        vec![
            BranchTag::new("inventory.checked"),
            BranchTag::new("order.validated"),
        ]
    }

    #[test]
    fn higher_priority_branch_wins_collisions() {
        let mut arrived = BTreeMap::new();
        arrived.insert(
            BranchTag::new("order.validated"),
            obj(json!({"orderId": "from-order", "validated": true})),
        );
        arrived.insert(
            BranchTag::new("inventory.checked"),
            obj(json!({"orderId": "from-inventory", "allAvailable": true})),
        );

        let merged = merge_payloads(&arrived, &priority());

        assert_eq!(merged["orderId"], json!("from-inventory"));
        assert_eq!(merged["validated"], json!(true));
        assert_eq!(merged["allAvailable"], json!(true));
    }

    #[test]
    fn ready_marker_overrides_branch_fields() {
        let mut arrived = BTreeMap::new();
        arrived.insert(
            BranchTag::new("order.validated"),
            obj(json!({READY_MARKER: false})),
        );

        let merged = merge_payloads(&arrived, &priority());

        assert_eq!(merged[READY_MARKER], json!(true));
    }

    #[test]
    fn serialized_merge_is_independent_of_insertion_order() {
        let a = obj(json!({"zeta": 1, "alpha": 2}));
        let b = obj(json!({"mid": 3, "alpha": 4}));

        let mut first = BTreeMap::new();
        first.insert(BranchTag::new("order.validated"), a.clone());
        first.insert(BranchTag::new("inventory.checked"), b.clone());

        let mut second = BTreeMap::new();
        second.insert(BranchTag::new("inventory.checked"), b);
        second.insert(BranchTag::new("order.validated"), a);

        let left = serde_json::to_vec(&merge_payloads(&first, &priority())).unwrap();
        let right = serde_json::to_vec(&merge_payloads(&second, &priority())).unwrap();
        assert_eq!(left, right);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn payload() -> impl Strategy<Value = Payload> {
            prop::collection::btree_map("[a-d]", any::<i32>(), 0..4)
                .prop_map(|fields| fields.into_iter().map(|(k, v)| (k, json!(v))).collect())
        }

        proptest! {
            #[test]
            fn each_field_comes_from_the_first_branch_declaring_it(
                inventory in payload(),
                order in payload(),
            ) {
                let mut arrived = BTreeMap::new();
                arrived.insert(BranchTag::new("inventory.checked"), inventory.clone());
                arrived.insert(BranchTag::new("order.validated"), order.clone());

                let merged = merge_payloads(&arrived, &priority());

                for (field, value) in &merged {
                    if field == READY_MARKER {
                        continue;
                    }
                    let expected = inventory.get(field).or_else(|| order.get(field));
                    prop_assert_eq!(Some(value), expected);
                }
                let union = inventory.keys().chain(order.keys()).collect::<std::collections::BTreeSet<_>>();
                prop_assert_eq!(merged.len(), union.len() + 1);
            }
        }
    }
}
