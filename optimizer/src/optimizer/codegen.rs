use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};

use basalt_core::{AssemblyItem, Instruction, MAX_SWAP_DEPTH};

use super::{
    StoreOperation,
    expression_classes::{Expr, ExpressionClasses, Id},
};
use crate::errors::OptimizerError;

// CSE CODE GENERATOR
// ================================================================================================

/// Generates code from a current stack layout, a target stack layout, and the known equivalence
/// classes.
///
/// Emission is driven by three obligations: storage and memory writes (and other observable
/// effects) happen in ascending sequence-number order, every class on the target stack is
/// materialized exactly where requested, and no class is computed before its operands are on the
/// stack. Within those constraints, values already on the stack are reused with DUP, dying values
/// are taken to their consumer with SWAP, and dead stack tops are retired with POP.
#[derive(Clone, Debug)]
pub(crate) struct CseCodeGenerator {
    /// The equivalence classes and how to compute them.
    classes: ExpressionClasses,
    /// Storage and memory writes, ascending by sequence number.
    store_operations: Vec<StoreOperation>,
    /// Sequenced classes that must be emitted even if their result is dead.
    effectful_classes: Vec<Id>,
    /// The items generated so far.
    generated: Vec<AssemblyItem>,
    /// Current stack height relative to the block entry.
    stack_height: i32,
    /// Lowest stack height the block interacts with.
    lowest_height: i32,
    /// Current stack layout.
    stack: BTreeMap<i32, Id>,
    /// All current stack positions of each class.
    positions: BTreeMap<Id, BTreeSet<i32>>,
    /// Classes that have been emitted (or were present on the initial stack).
    computed: BTreeSet<Id>,
    /// If `b` is in `needed_by[a]`, then `a` is an operand needed to compute `b`.
    needed_by: BTreeMap<Id, BTreeSet<Id>>,
    /// All classes reachable from the emission roots.
    requested: BTreeSet<Id>,
    /// Remaining number of uses of each class by not-yet-emitted store operations.
    pending_store_uses: BTreeMap<Id, usize>,
    /// Classes that have to be present on the stack at the end.
    final_classes: BTreeSet<Id>,
}

/// One sequence-constrained emission obligation.
#[derive(Clone, Copy, Debug)]
enum SequencedTask {
    /// Emit the store operation with the given log index.
    Store(usize),
    /// Materialize a sequence-stamped class.
    Class(Id),
}

impl CseCodeGenerator {
    /// Returns a new generator over the given classes, write log (sorted ascending by sequence
    /// number), and mandatory effectful classes.
    pub fn new(
        classes: ExpressionClasses,
        store_operations: Vec<StoreOperation>,
        effectful_classes: Vec<Id>,
    ) -> Self {
        debug_assert!(store_operations.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        Self {
            classes,
            store_operations,
            effectful_classes,
            generated: Vec::new(),
            stack_height: 0,
            lowest_height: 1,
            stack: BTreeMap::new(),
            positions: BTreeMap::new(),
            computed: BTreeSet::new(),
            needed_by: BTreeMap::new(),
            requested: BTreeSet::new(),
            pending_store_uses: BTreeMap::new(),
            final_classes: BTreeSet::new(),
        }
    }

    /// Generates the assembly items that transform `initial_stack` into `target_stack` while
    /// performing all logged writes in order.
    pub fn generate_code(
        mut self,
        initial_stack: &BTreeMap<i32, Id>,
        target_stack: &BTreeMap<i32, Id>,
    ) -> Result<Vec<AssemblyItem>, OptimizerError> {
        for (&height, &id) in initial_stack {
            self.stack.insert(height, id);
            self.positions.entry(id).or_default().insert(height);
            self.computed.insert(id);
        }
        self.stack_height = initial_stack.keys().next_back().copied().unwrap_or(0);
        self.lowest_height = initial_stack.keys().next().copied().unwrap_or(1);

        // discover all classes that must be realized, starting from the target stack, the write
        // log, and the mandatory effects
        let store_operations = core::mem::take(&mut self.store_operations);
        for op in &store_operations {
            self.add_dependencies(op.slot);
            self.add_dependencies(op.value);
            *self.pending_store_uses.entry(op.slot).or_default() += 1;
            *self.pending_store_uses.entry(op.value).or_default() += 1;
        }
        let effectful_classes = core::mem::take(&mut self.effectful_classes);
        for &id in &effectful_classes {
            self.add_dependencies(id);
        }
        for &id in target_stack.values() {
            self.final_classes.insert(id);
            self.add_dependencies(id);
        }

        // emit all sequence-constrained operations in order: writes have unique sequence
        // numbers, and a stamped read sorts after the write that preceded it and before the next
        let mut tasks: Vec<(u32, u8, u32, SequencedTask)> = Vec::new();
        for (index, op) in store_operations.iter().enumerate() {
            tasks.push((op.seq, 0, index as u32, SequencedTask::Store(index)));
        }
        let sequenced: Vec<Id> = self
            .requested
            .iter()
            .copied()
            .filter(|&id| self.classes.representative(id).sequence_number() != 0)
            .collect();
        for (ordinal, &id) in sequenced.iter().enumerate() {
            let seq = self.classes.representative(id).sequence_number();
            tasks.push((seq, 1, ordinal as u32, SequencedTask::Class(id)));
        }
        tasks.sort_by_key(|&(seq, kind, ordinal, _)| (seq, kind, ordinal));
        for (_, _, _, task) in tasks {
            match task {
                SequencedTask::Store(index) => self.generate_store(&store_operations[index])?,
                SequencedTask::Class(id) => {
                    self.generate_class_element(id, true)?;
                },
            }
        }

        // materialize the remaining (pure) classes of the target stack
        for &id in target_stack.values() {
            self.generate_class_element(id, false)?;
        }

        // retire dead values and reorder into the requested layout
        self.align_stack(target_stack)?;
        Ok(self.generated)
    }

    // DEPENDENCY DISCOVERY
    // --------------------------------------------------------------------------------------------

    /// Recursively records all operand dependencies of the given class.
    fn add_dependencies(&mut self, id: Id) {
        if !self.requested.insert(id) {
            return;
        }
        let operands = self.classes.representative(id).operands().to_vec();
        for operand in operands {
            self.needed_by.entry(operand).or_default().insert(id);
            self.add_dependencies(operand);
        }
    }

    // EMISSION
    // --------------------------------------------------------------------------------------------

    /// Produces code that materializes the given class unless it is already present, and returns
    /// its stack position (`None` for classes that do not leave a value on the stack).
    fn generate_class_element(
        &mut self,
        id: Id,
        allow_sequenced: bool,
    ) -> Result<Option<i32>, OptimizerError> {
        while self.remove_stack_top_if_possible()? {}

        if self.computed.contains(&id) {
            if let Some(position) = self.positions.get(&id).and_then(|p| p.last().copied()) {
                return Ok(Some(position));
            }
            if !self.produces_value(id) {
                return Ok(None);
            }
            return Err(OptimizerError::internal("class already retired but still needed"));
        }

        let expr = self.classes.representative(id).clone();
        let Expr::Computed { item, operands, seq } = expr else {
            return Err(OptimizerError::internal(
                "initial stack element requested for recomputation",
            ));
        };
        if seq != 0 && !allow_sequenced {
            return Err(OptimizerError::internal(
                "sequence-constrained operation requested out of order",
            ));
        }

        // make sure all operands are available somewhere on the stack
        for &operand in operands.iter().rev() {
            self.generate_class_element(operand, false)?;
        }

        // move or copy the operands to the top, ending with the first operand topmost
        match *operands.as_slice() {
            [] => {},
            [a] => self.place_single_operand(a, Some(id))?,
            [a, b] => self.place_operand_pair(a, b, Some(id))?,
            _ => self.place_operands_by_copy(&operands)?,
        }
        self.verify_operands(&operands)?;
        self.emit_consuming(item, Some(id))
    }

    /// Emits one write from the log: materializes the value, then the slot above it, and appends
    /// the store item.
    fn generate_store(&mut self, op: &StoreOperation) -> Result<(), OptimizerError> {
        while self.remove_stack_top_if_possible()? {}

        self.generate_class_element(op.value, false)?;
        // pre-position a consumable copy of the value so that a freshly emitted slot lands right
        // above it; the pending use by this store is discounted when deciding between moving and
        // copying
        let position = self.class_position(op.value)?;
        if self.move_allowed(op.value, None, 1) {
            self.append_or_remove_swap(position)?;
        } else {
            self.append_dup(position)?;
        }

        self.generate_class_element(op.slot, false)?;
        self.release_store_use(op.value);
        self.release_store_use(op.slot);

        self.place_operand_pair(op.slot, op.value, None)?;
        self.verify_operands(&[op.slot, op.value])?;
        self.emit_consuming(op.item.clone(), None)?;
        Ok(())
    }

    // OPERAND PLACEMENT
    // --------------------------------------------------------------------------------------------

    fn place_single_operand(&mut self, a: Id, result: Option<Id>) -> Result<(), OptimizerError> {
        let position = self.class_position(a)?;
        if self.move_allowed(a, result, 0) {
            self.append_or_remove_swap(position)
        } else {
            self.append_dup(position)
        }
    }

    /// Brings `a0` to the top of the stack with `a1` directly below it, moving operands whose
    /// last use this is and copying operands that stay live.
    fn place_operand_pair(
        &mut self,
        a0: Id,
        a1: Id,
        result: Option<Id>,
    ) -> Result<(), OptimizerError> {
        if self.move_allowed(a1, result, 0) {
            self.append_or_remove_swap(self.class_position(a1)?)?;
            if a0 == a1 {
                self.append_dup(self.stack_height)?;
            } else if self.move_allowed(a0, result, 0) {
                self.append_or_remove_swap(self.stack_height - 1)?;
                self.append_or_remove_swap(self.class_position(a0)?)?;
            } else {
                self.append_dup(self.class_position(a0)?)?;
            }
        } else if a0 == a1 {
            self.append_dup(self.class_position(a0)?)?;
            self.append_dup(self.stack_height)?;
        } else if self.move_allowed(a0, result, 0) {
            self.append_or_remove_swap(self.class_position(a0)?)?;
            self.append_dup(self.class_position(a1)?)?;
            self.append_or_remove_swap(self.stack_height - 1)?;
        } else {
            self.append_dup(self.class_position(a1)?)?;
            self.append_dup(self.class_position(a0)?)?;
        }
        Ok(())
    }

    /// Conservative placement for operations with three or more operands: every operand is
    /// copied, leftover originals are retired once they surface.
    fn place_operands_by_copy(&mut self, operands: &[Id]) -> Result<(), OptimizerError> {
        for &operand in operands.iter().rev() {
            self.append_dup(self.class_position(operand)?)?;
        }
        Ok(())
    }

    /// Checks that `operands[i]` sits at depth `i` below the stack top.
    fn verify_operands(&self, operands: &[Id]) -> Result<(), OptimizerError> {
        for (i, operand) in operands.iter().enumerate() {
            let height = self.stack_height - i as i32;
            if self.stack.get(&height) != Some(operand) {
                return Err(OptimizerError::internal("operand not in position before emission"));
            }
        }
        Ok(())
    }

    /// Appends the item, consuming its stack arguments and binding the produced value (if any)
    /// to `result`.
    fn emit_consuming(
        &mut self,
        item: AssemblyItem,
        result: Option<Id>,
    ) -> Result<Option<i32>, OptimizerError> {
        let args = item.args();
        for i in 0..args {
            let height = self.stack_height - i as i32;
            let Some(id) = self.stack.remove(&height) else {
                return Err(OptimizerError::internal("operation consumes an empty stack slot"));
            };
            self.remove_position(id, height);
        }
        self.stack_height -= args as i32;

        let out = item.out();
        self.generated.push(item);
        let position = match out {
            0 => None,
            1 => {
                self.stack_height += 1;
                let id = result
                    .ok_or(OptimizerError::internal("emitted value is not bound to a class"))?;
                self.stack.insert(self.stack_height, id);
                self.positions.entry(id).or_default().insert(self.stack_height);
                Some(self.stack_height)
            },
            _ => return Err(OptimizerError::internal("operations may push at most one result")),
        };
        if let Some(id) = result {
            self.computed.insert(id);
        }
        Ok(position)
    }

    // LIVENESS
    // --------------------------------------------------------------------------------------------

    /// Returns true if the element can be dropped from the stack: it is not finally needed, it
    /// has no remaining store uses beyond `pending_allowance`, and every class needing it other
    /// than `result` has already been computed.
    fn can_be_removed(&self, element: Id, result: Option<Id>, pending_allowance: usize) -> bool {
        if self.final_classes.contains(&element) {
            return false;
        }
        if self.pending_store_uses.get(&element).copied().unwrap_or(0) > pending_allowance {
            return false;
        }
        match self.needed_by.get(&element) {
            Some(users) => {
                users.iter().all(|user| Some(*user) == result || self.computed.contains(user))
            },
            None => true,
        }
    }

    /// Returns true if a copy of the element may be consumed in place: either further copies
    /// remain on the stack, or the element is no longer needed at all.
    fn move_allowed(&self, element: Id, result: Option<Id>, pending_allowance: usize) -> bool {
        self.positions.get(&element).is_some_and(|p| p.len() > 1)
            || self.can_be_removed(element, result, pending_allowance)
    }

    /// Appends a POP if the topmost stack element is no longer needed.
    fn remove_stack_top_if_possible(&mut self) -> Result<bool, OptimizerError> {
        let Some(&top) = self.stack.get(&self.stack_height) else {
            return Ok(false);
        };
        if !self.can_be_removed(top, None, 0) {
            return Ok(false);
        }
        self.append_pop()?;
        Ok(true)
    }

    fn release_store_use(&mut self, id: Id) {
        if let Some(uses) = self.pending_store_uses.get_mut(&id) {
            *uses = uses.saturating_sub(1);
        }
    }

    fn produces_value(&self, id: Id) -> bool {
        match self.classes.representative(id) {
            Expr::EntryValue(_) => true,
            Expr::Computed { item, .. } => item.out() == 1,
        }
    }

    // STACK REORGANIZATION
    // --------------------------------------------------------------------------------------------

    /// Reorders the stack so that it matches the target layout height for height, duplicating
    /// classes requested in several positions and popping everything surplus.
    fn align_stack(&mut self, target_stack: &BTreeMap<i32, Id>) -> Result<(), OptimizerError> {
        while self.remove_stack_top_if_possible()? {}

        let target_height = match target_stack.keys().next_back() {
            Some(&height) => height,
            None => self.lowest_height - 1,
        };
        let limit = (target_stack.len() + self.stack.len() + 8).pow(2);
        for _ in 0..limit {
            let mismatch = target_stack
                .iter()
                .find(|&(&height, want)| {
                    height <= self.stack_height && self.stack.get(&height) != Some(want)
                })
                .map(|(&height, &want)| (height, want));

            if let Some((height, want)) = mismatch {
                let position = self.class_position(want)?;
                if position == self.stack_height {
                    self.append_or_remove_swap(height)?;
                } else if height == self.stack_height {
                    self.append_dup(position)?;
                } else if self.satisfies_target(position, target_stack, target_height) {
                    // this copy already fills a target slot, so work with a duplicate
                    self.append_dup(position)?;
                } else {
                    self.append_or_remove_swap(position)?;
                }
            } else if self.stack_height < target_height {
                let next = self.stack_height + 1;
                let want = *target_stack
                    .get(&next)
                    .ok_or(OptimizerError::internal("target stack layout has a gap"))?;
                let position = self.class_position(want)?;
                self.append_dup(position)?;
            } else if self.stack_height > target_height {
                if !self.remove_stack_top_if_possible()? {
                    self.pop_surplus_top(target_stack)?;
                }
            } else {
                return Ok(());
            }
        }
        Err(OptimizerError::internal("stack reorganization did not converge"))
    }

    fn satisfies_target(
        &self,
        position: i32,
        target_stack: &BTreeMap<i32, Id>,
        target_height: i32,
    ) -> bool {
        position <= target_height
            && target_stack
                .get(&position)
                .is_some_and(|want| self.stack.get(&position) == Some(want))
    }

    /// Pops a leftover copy of a class whose target slots are all filled.
    fn pop_surplus_top(&mut self, target_stack: &BTreeMap<i32, Id>) -> Result<(), OptimizerError> {
        let Some(&top) = self.stack.get(&self.stack_height) else {
            return Err(OptimizerError::internal("surplus stack slot is empty"));
        };
        let satisfied = target_stack
            .iter()
            .filter(|&(_, &want)| want == top)
            .all(|(&height, _)| height < self.stack_height && self.stack.get(&height) == Some(&top));
        if !satisfied {
            return Err(OptimizerError::internal("unable to retire surplus stack top"));
        }
        self.append_pop()
    }

    // LOW-LEVEL APPENDS
    // --------------------------------------------------------------------------------------------

    /// Returns the position of the copy of the class nearest to the stack top.
    fn class_position(&self, id: Id) -> Result<i32, OptimizerError> {
        self.positions
            .get(&id)
            .and_then(|p| p.last().copied())
            .ok_or(OptimizerError::internal("requested class has no copy on the stack"))
    }

    /// Appends a DUP retrieving the element at the given stack position.
    fn append_dup(&mut self, from_position: i32) -> Result<(), OptimizerError> {
        let depth = self.stack_height - from_position + 1;
        if depth < 1 {
            return Err(OptimizerError::internal("dup from above the stack top"));
        }
        if depth > MAX_SWAP_DEPTH as i32 {
            return Err(OptimizerError::StackTooDeep { depth: depth as usize });
        }
        let Some(&id) = self.stack.get(&from_position) else {
            return Err(OptimizerError::internal("dup from an empty stack slot"));
        };
        self.generated.push(AssemblyItem::Op(Instruction::Dup(depth as u8)));
        self.stack_height += 1;
        self.stack.insert(self.stack_height, id);
        self.positions.entry(id).or_default().insert(self.stack_height);
        Ok(())
    }

    /// Appends a SWAP exchanging the stack top with the element at the given position; if the
    /// previous generated item is the identical SWAP, both cancel instead.
    fn append_or_remove_swap(&mut self, from_position: i32) -> Result<(), OptimizerError> {
        if from_position == self.stack_height {
            return Ok(());
        }
        let depth = self.stack_height - from_position;
        if depth < 1 {
            return Err(OptimizerError::internal("swap with an element above the stack top"));
        }
        if depth > MAX_SWAP_DEPTH as i32 {
            return Err(OptimizerError::StackTooDeep { depth: depth as usize });
        }
        let top_height = self.stack_height;
        let (Some(&top), Some(&deep)) =
            (self.stack.get(&top_height), self.stack.get(&from_position))
        else {
            return Err(OptimizerError::internal("swap with an empty stack slot"));
        };
        if top == deep {
            // exchanging two copies of the same class has no effect
            return Ok(());
        }

        self.stack.insert(top_height, deep);
        self.stack.insert(from_position, top);
        self.remove_position(top, top_height);
        self.positions.entry(top).or_default().insert(from_position);
        self.remove_position(deep, from_position);
        self.positions.entry(deep).or_default().insert(top_height);

        let item = AssemblyItem::Op(Instruction::Swap(depth as u8));
        if self.generated.last() == Some(&item) {
            self.generated.pop();
        } else {
            self.generated.push(item);
        }
        Ok(())
    }

    /// Appends a POP removing the topmost stack element.
    fn append_pop(&mut self) -> Result<(), OptimizerError> {
        let Some(id) = self.stack.remove(&self.stack_height) else {
            return Err(OptimizerError::internal("pop from an empty stack slot"));
        };
        self.remove_position(id, self.stack_height);
        self.generated.push(AssemblyItem::Op(Instruction::Pop));
        self.stack_height -= 1;
        Ok(())
    }

    fn remove_position(&mut self, id: Id, height: i32) {
        if let Some(positions) = self.positions.get_mut(&id) {
            positions.remove(&height);
            if positions.is_empty() {
                self.positions.remove(&id);
            }
        }
    }
}
