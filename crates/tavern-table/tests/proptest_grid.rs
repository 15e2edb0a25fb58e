// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests: grid and sprite-index invariants under random mutation.

use proptest::prelude::*;
use tavern_table::{EntityDescriptor, EntityId, Layer, Position, Table};

const W: u32 = 8;
const H: u32 = 8;

#[derive(Debug, Clone)]
enum Op {
    Add(u32, u32, Layer),
    Move(usize, u32, u32),
    Remove(usize),
}

fn arb_layer() -> impl Strategy<Value = Layer> {
    prop::sample::select(Layer::ALL.to_vec())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..W, 0..H, arb_layer()).prop_map(|(x, y, l)| Op::Add(x, y, l)),
        (any::<usize>(), 0..W * 2, 0..H * 2).prop_map(|(i, x, y)| Op::Move(i, x, y)),
        any::<usize>().prop_map(Op::Remove),
    ]
}

/// After any operation sequence, every occupied cell agrees with its
/// entity's position and layer, the sprite index is exact, and every
/// position is in bounds.
fn check_invariants(table: &Table) {
    for entity in table.entities() {
        // Positions are in bounds.
        assert!(entity.position.x() < W && entity.position.y() < H);
        // Sprite index maps back to the entity.
        let via_sprite = table.find_entity_by_sprite(&entity.sprite_id).unwrap();
        assert_eq!(via_sprite.entity_id, entity.entity_id);
    }
    // Occupied cells agree with their entity (checked through the public
    // point query per layer).
    for layer in Layer::ALL {
        for y in 0..H {
            for x in 0..W {
                if let Some(e) = table.entity_at(Position(x, y), Some(*layer)) {
                    assert_eq!(e.position, Position(x, y), "grid/entity disagree");
                    assert_eq!(e.layer, *layer, "grid/entity layer disagree");
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_under_random_ops(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut table = Table::new("prop", W, H).unwrap();
        let mut ids: Vec<EntityId> = Vec::new();

        for op in ops {
            match op {
                Op::Add(x, y, layer) => {
                    let id = table
                        .add_entity(EntityDescriptor::at((x, y)).on_layer(layer))
                        .unwrap()
                        .entity_id;
                    ids.push(id);
                }
                Op::Move(i, x, y) if !ids.is_empty() => {
                    let id = ids[i % ids.len()];
                    let before = table.entity(id).map(|e| (e.position, e.layer));
                    let result = table.move_entity(id, Position(x, y), None);
                    if result.is_err() {
                        // Move atomicity: failure leaves the entity as it was.
                        let after = table.entity(id).map(|e| (e.position, e.layer));
                        prop_assert_eq!(before, after);
                    }
                }
                Op::Remove(i) if !ids.is_empty() => {
                    let id = ids.remove(i % ids.len());
                    let _ = table.remove_entity(id);
                }
                _ => {}
            }
            check_invariants(&table);
        }
    }
}
