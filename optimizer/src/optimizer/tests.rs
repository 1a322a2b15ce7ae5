use alloc::{collections::BTreeMap, vec::Vec};

use basalt_core::{AssemblyItem, Instruction, TagId, U256};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

use super::{
    CommonSubexpressionEliminator, codegen::CseCodeGenerator, expression_classes::ExpressionClasses,
    optimize_block, optimize_items,
};
use crate::testing::MachineState;

fn op(inst: Instruction) -> AssemblyItem {
    AssemblyItem::Op(inst)
}

fn push(value: u64) -> AssemblyItem {
    AssemblyItem::push(value)
}

/// Executes `items` and `optimized` from the same machine state and checks that the final states
/// agree.
fn assert_same_semantics(items: &[AssemblyItem], optimized: &[AssemblyItem]) {
    let mut original = MachineState::with_stack([3, 0, 7, 1, 9, 2, 5, 4]);
    original.storage.insert(U256::from(1u64), U256::from(11u64));
    original.memory.insert(U256::from(2u64), U256::from(13u64));
    let mut candidate = original.clone();

    original.execute(items).expect("original block must execute");
    candidate.execute(optimized).expect("optimized block must execute");
    assert_eq!(original, candidate);
}

// BOUNDARIES
// ================================================================================================

#[test]
fn empty_block_produces_no_items() {
    assert_eq!(optimize_block(&[]).unwrap(), Vec::new());
    assert_eq!(optimize_items(&[]).unwrap(), Vec::new());
}

#[test]
fn single_push_requested_on_target_stack_is_kept() {
    let items = [push(7)];
    assert_eq!(optimize_block(&items).unwrap(), items);
}

#[test]
fn value_not_requested_on_target_stack_is_dropped() {
    let mut classes = ExpressionClasses::default();
    classes.find(push(7), Vec::new(), 0);
    let generator = CseCodeGenerator::new(classes, Vec::new(), Vec::new());
    let items = generator.generate_code(&BTreeMap::new(), &BTreeMap::new()).unwrap();
    assert_eq!(items, Vec::new());
}

#[test]
fn dup_pop_is_elided_entirely() {
    let items = [op(Instruction::Dup(1)), op(Instruction::Pop)];
    assert_eq!(optimize_block(&items).unwrap(), Vec::new());
}

#[test]
fn pop_only_block_is_kept() {
    let items = [op(Instruction::Pop), op(Instruction::Pop)];
    let optimized = optimize_block(&items).unwrap();
    assert_eq!(optimized, items);
}

// CONCRETE SCENARIOS
// ================================================================================================

#[test]
fn repeated_arithmetic_is_folded_and_duplicated() {
    let items = [
        push(7),
        push(3),
        op(Instruction::Add),
        push(7),
        push(3),
        op(Instruction::Add),
    ];
    let optimized = optimize_block(&items).unwrap();
    assert_eq!(optimized, [push(10), op(Instruction::Dup(1))]);
    assert_same_semantics(&items, &optimized);
}

#[test]
fn commutated_sums_share_one_computation() {
    // computes x + y twice with the operands pushed in both orders
    let items = [
        op(Instruction::Dup(2)),
        op(Instruction::Dup(2)),
        op(Instruction::Add),
        op(Instruction::Dup(2)),
        op(Instruction::Dup(4)),
        op(Instruction::Add),
    ];
    let optimized = optimize_block(&items).unwrap();
    let adds = optimized.iter().filter(|item| **item == op(Instruction::Add)).count();
    assert_eq!(adds, 1, "the sum must be computed once: {optimized:?}");
    assert_eq!(
        optimized,
        [op(Instruction::Dup(1)), op(Instruction::Dup(3)), op(Instruction::Add), op(Instruction::Dup(1))]
    );
    assert_same_semantics(&items, &optimized);
}

#[test]
fn self_cancellation_collapses_to_constant() {
    // x + 0 - x cancels to the constant zero, which replaces the entry element
    let items =
        [op(Instruction::Dup(1)), push(0), op(Instruction::Add), op(Instruction::Sub)];
    let optimized = optimize_block(&items).unwrap();
    assert_eq!(optimized, [op(Instruction::Pop), push(0)]);
    assert_same_semantics(&items, &optimized);
}

#[test]
fn stored_value_is_reused_for_the_following_load() {
    let items = [
        push(42),
        push(1),
        op(Instruction::SStore),
        push(1),
        op(Instruction::SLoad),
    ];
    let optimized = optimize_block(&items).unwrap();
    assert_eq!(
        optimized,
        [push(42), op(Instruction::Dup(1)), push(1), op(Instruction::SStore)]
    );
    assert_same_semantics(&items, &optimized);
}

#[test]
fn impure_barrier_keeps_both_loads_in_order() {
    let items = [
        push(5),
        op(Instruction::SLoad),
        push(9),
        op(Instruction::Balance),
        push(5),
        op(Instruction::SLoad),
    ];
    let optimized = optimize_block(&items).unwrap();

    let loads: Vec<usize> = optimized
        .iter()
        .enumerate()
        .filter_map(|(i, item)| (*item == op(Instruction::SLoad)).then_some(i))
        .collect();
    let barriers: Vec<usize> = optimized
        .iter()
        .enumerate()
        .filter_map(|(i, item)| (*item == op(Instruction::Balance)).then_some(i))
        .collect();
    assert_eq!(loads.len(), 2, "the barrier must prevent merging the loads: {optimized:?}");
    assert_eq!(barriers.len(), 1);
    assert!(loads[0] < barriers[0] && barriers[0] < loads[1]);
}

#[test]
fn cancelling_swaps_are_elided() {
    // placing both operands of SUB would emit SWAP1 SWAP1, which must cancel
    let items = [op(Instruction::Sub)];
    assert_eq!(optimize_block(&items).unwrap(), items);
}

#[test]
fn lone_swap_passes_through() {
    let items = [op(Instruction::Swap(1))];
    assert_eq!(optimize_block(&items).unwrap(), items);
}

// STORES AND EFFECTS
// ================================================================================================

#[test]
fn repeated_stores_to_one_slot_stay_in_sequence() {
    let items = [
        push(1),
        push(7),
        op(Instruction::SStore),
        push(2),
        push(7),
        op(Instruction::SStore),
    ];
    let optimized = optimize_block(&items).unwrap();
    let stores = optimized.iter().filter(|item| **item == op(Instruction::SStore)).count();
    assert_eq!(stores, 2, "every write must survive: {optimized:?}");
    assert_same_semantics(&items, &optimized);
}

#[test]
fn storage_write_keeps_memory_knowledge() {
    let items = [
        push(5),
        push(1),
        op(Instruction::MStore),
        push(9),
        push(2),
        op(Instruction::SStore),
        push(1),
        op(Instruction::MLoad),
    ];
    let optimized = optimize_block(&items).unwrap();
    assert!(
        !optimized.contains(&op(Instruction::MLoad)),
        "the stored value must be reused without re-reading: {optimized:?}"
    );
    assert_same_semantics(&items, &optimized);
}

#[test]
fn dropped_call_result_is_still_executed() {
    // a LOG is pure noise for the stack but must survive as an observable effect
    let items = [push(32), push(0), op(Instruction::Log(0))];
    let optimized = optimize_block(&items).unwrap();
    let logs = optimized.iter().filter(|item| **item == op(Instruction::Log(0))).count();
    assert_eq!(logs, 1, "effectful operations may not be dropped: {optimized:?}");
}

// TOP-LEVEL LOOP
// ================================================================================================

#[test]
fn blocks_are_split_at_tags_and_boundaries_kept() {
    let tag = AssemblyItem::Tag(TagId::new(1));
    let items = [
        push(1),
        push(2),
        op(Instruction::Add),
        tag.clone(),
        push(1),
        push(2),
        op(Instruction::Add),
    ];
    let optimized = optimize_items(&items).unwrap();
    assert_eq!(optimized, [push(3), tag, push(3)]);
}

#[test]
fn jump_and_jumpdest_are_emitted_verbatim() {
    let items = [
        AssemblyItem::PushTag(TagId::new(5)),
        op(Instruction::Jump),
        op(Instruction::JumpDest),
        push(1),
        push(2),
        op(Instruction::Add),
    ];
    let optimized = optimize_items(&items).unwrap();
    assert_eq!(
        optimized,
        [
            AssemblyItem::PushTag(TagId::new(5)),
            op(Instruction::Jump),
            op(Instruction::JumpDest),
            push(3),
        ]
    );
}

#[test]
fn block_needing_too_deep_access_falls_back_to_original() {
    let mut items: Vec<AssemblyItem> = (1u64..=17).map(push).collect();
    items.push(op(Instruction::Dup(17)));

    assert_eq!(
        optimize_block(&items),
        Err(crate::OptimizerError::StackTooDeep { depth: 17 })
    );
    // the glue keeps the original items instead
    assert_eq!(optimize_items(&items).unwrap(), items);
}

#[test]
fn stack_underflow_is_surfaced() {
    let items = vec![op(Instruction::Pop); 1025];
    assert_eq!(
        optimize_items(&items),
        Err(crate::OptimizerError::StackUnderflow { offset: 1024 })
    );
}

#[test]
fn feed_items_stops_at_the_boundary() {
    let mut eliminator = CommonSubexpressionEliminator::new();
    let items = [push(1), op(Instruction::Jump), push(2)];
    let rest = eliminator.feed_items(&items).unwrap();
    assert_eq!(rest, &items[1..]);
}

#[test]
fn stream_dumps_classes_and_store_log() {
    let mut eliminator = CommonSubexpressionEliminator::new();
    let items = [push(42), push(1), op(Instruction::SStore)];
    eliminator.feed_items(&items).unwrap();

    let mut dump = alloc::string::String::new();
    eliminator.stream(&mut dump, &BTreeMap::new(), &BTreeMap::new()).unwrap();
    assert!(dump.contains("Equivalence classes:"));
    assert!(dump.contains("PUSH 0x2a"));
    assert!(dump.contains("SSTORE"));
}

// IDEMPOTENCE
// ================================================================================================

#[rstest]
#[case::folded_sum(vec![push(7), push(3), op(Instruction::Add), push(7), push(3), op(Instruction::Add)])]
#[case::cancellation(vec![op(Instruction::Dup(1)), push(0), op(Instruction::Add), op(Instruction::Sub)])]
#[case::store_then_load(vec![push(42), push(1), op(Instruction::SStore), push(1), op(Instruction::SLoad)])]
#[case::barrier(vec![
    push(5),
    op(Instruction::SLoad),
    push(9),
    op(Instruction::Balance),
    push(5),
    op(Instruction::SLoad),
])]
#[case::bare_sub(vec![op(Instruction::Sub)])]
#[case::pops(vec![op(Instruction::Pop), op(Instruction::Pop)])]
fn optimization_is_idempotent(#[case] items: Vec<AssemblyItem>) {
    let once = optimize_items(&items).unwrap();
    let twice = optimize_items(&once).unwrap();
    assert_eq!(once, twice);
}

// SEMANTIC PRESERVATION
// ================================================================================================

fn item_strategy() -> impl Strategy<Value = AssemblyItem> {
    prop_oneof![
        (0u64..6).prop_map(AssemblyItem::push),
        Just(op(Instruction::Add)),
        Just(op(Instruction::Sub)),
        Just(op(Instruction::Mul)),
        Just(op(Instruction::Div)),
        Just(op(Instruction::And)),
        Just(op(Instruction::Or)),
        Just(op(Instruction::Xor)),
        Just(op(Instruction::Not)),
        Just(op(Instruction::IsZero)),
        Just(op(Instruction::Eq)),
        Just(op(Instruction::Lt)),
        Just(op(Instruction::Gt)),
        Just(op(Instruction::Pop)),
        Just(op(Instruction::SLoad)),
        Just(op(Instruction::SStore)),
        Just(op(Instruction::MLoad)),
        Just(op(Instruction::MStore)),
        (1u8..=4).prop_map(|n| op(Instruction::Dup(n))),
        (1u8..=3).prop_map(|n| op(Instruction::Swap(n))),
    ]
}

proptest! {
    #[test]
    fn optimized_blocks_preserve_semantics(
        items in proptest::collection::vec(item_strategy(), 0..24)
    ) {
        let mut original = MachineState::with_stack([3, 0, 7, 1, 9, 2, 5, 4]);
        original.storage.insert(U256::from(1u64), U256::from(11u64));
        original.memory.insert(U256::from(2u64), U256::from(13u64));
        let mut candidate = original.clone();

        // skip programs that underflow the eight-element test stack
        if original.execute(&items).is_none() {
            return Ok(());
        }

        let optimized = optimize_items(&items);
        prop_assert!(optimized.is_ok(), "optimization failed: {:?}", optimized);
        let optimized = optimized.unwrap();
        prop_assert!(
            candidate.execute(&optimized).is_some(),
            "optimized block must execute: {optimized:?}"
        );
        prop_assert_eq!(original, candidate);
    }
}
