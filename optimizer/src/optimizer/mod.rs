//! Common subexpression elimination and stack reorganization.
//!
//! The optimizer works on one basic block at a time. During the *feed* phase each assembly item
//! is folded into a virtual machine state: a stack of equivalence-class ids, knowledge about
//! storage and memory contents, and an ordered log of writes. During the *schedule* phase the
//! [`codegen::CseCodeGenerator`] re-emits an equivalent item sequence from the target stack
//! layout and the write log, computing every class at most once.

use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;

use basalt_core::{AssemblyItem, Instruction, STACK_DEPTH_LIMIT, semantics};
use tracing::{debug, instrument, warn};

use crate::errors::OptimizerError;

mod codegen;
pub mod expression_classes;

#[cfg(test)]
mod tests;

use self::{
    codegen::CseCodeGenerator,
    expression_classes::{ExpressionClasses, Id},
};

// STORE OPERATION
// ================================================================================================

/// Record of a storage or memory write: the representative item (SSTORE or MSTORE), the class of
/// the written slot, the sequence number at which the write took effect, and the class of the
/// written value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOperation {
    pub item: AssemblyItem,
    pub slot: Id,
    pub seq: u32,
    pub value: Id,
}

// COMMON SUBEXPRESSION ELIMINATOR
// ================================================================================================

/// Optimizer step that performs common subexpression elimination and stack reorganization: it
/// infers equality among the expressions computed inside one basic block and computes the value
/// of equal expressions only once.
///
/// Feed items with [`Self::feed_items`]; the call stops in front of the first item that starts a
/// new basic block. [`Self::optimized_items`] then consumes the eliminator and returns the
/// regenerated code for the block.
#[derive(Clone, Debug)]
pub struct CommonSubexpressionEliminator {
    /// Current stack height relative to the beginning of the block; can be negative.
    stack_height: i32,
    /// Current stack layout, mapping stack height to equivalence class.
    stack_elements: BTreeMap<i32, Id>,
    /// Current sequence number; incremented with each modification of storage or memory.
    sequence_number: u32,
    /// Known storage contents, mapping slot class to value class.
    storage_content: BTreeMap<Id, Id>,
    /// Known memory contents, mapping slot class to value class.
    memory_content: BTreeMap<Id, Id>,
    /// Storage and memory writes in the order they took effect.
    store_operations: Vec<StoreOperation>,
    /// Opaque sequenced classes whose emission is mandatory (calls, logs, data copies), in the
    /// order they were fed.
    effectful_classes: Vec<Id>,
    /// The classes of equivalent expressions known so far.
    expression_classes: ExpressionClasses,
    /// Number of items fed so far, used as error context.
    fed_items: usize,
}

impl Default for CommonSubexpressionEliminator {
    fn default() -> Self {
        Self {
            stack_height: 0,
            stack_elements: BTreeMap::new(),
            sequence_number: 1,
            storage_content: BTreeMap::new(),
            memory_content: BTreeMap::new(),
            store_operations: Vec::new(),
            effectful_classes: Vec::new(),
            expression_classes: ExpressionClasses::default(),
            fed_items: 0,
        }
    }
}

impl CommonSubexpressionEliminator {
    /// Returns a new eliminator with an empty machine state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds assembly items into the eliminator until the first item that starts a new basic
    /// block, and returns the remaining items beginning with that boundary item (which is not
    /// consumed).
    pub fn feed_items<'a>(
        &mut self,
        items: &'a [AssemblyItem],
    ) -> Result<&'a [AssemblyItem], OptimizerError> {
        let mut pos = 0;
        while pos < items.len() && !semantics::breaks_basic_block(&items[pos]) {
            self.feed_item(&items[pos])?;
            pos += 1;
        }
        Ok(&items[pos..])
    }

    /// Consumes the eliminator and returns the optimized items for the block.
    pub fn optimized_items(mut self) -> Result<Vec<AssemblyItem>, OptimizerError> {
        let mut min_height = self.stack_height + 1;
        if let Some(&lowest) = self.stack_elements.keys().next() {
            min_height = min_height.min(lowest);
        }

        let mut initial_stack = BTreeMap::new();
        for height in min_height..=0 {
            initial_stack.insert(height, self.expression_classes.entry_value(height));
        }
        let mut target_stack = BTreeMap::new();
        for height in min_height..=self.stack_height {
            let id = match self.stack_elements.get(&height) {
                Some(&id) => id,
                None => self.expression_classes.entry_value(height),
            };
            target_stack.insert(height, id);
        }

        let generator = CseCodeGenerator::new(
            self.expression_classes,
            self.store_operations,
            self.effectful_classes,
        );
        generator.generate_code(&initial_stack, &target_stack)
    }

    /// Writes a human-readable dump of the current equivalence classes, write log, and the given
    /// stack layouts.
    pub fn stream<W: fmt::Write>(
        &self,
        out: &mut W,
        initial_stack: &BTreeMap<i32, Id>,
        target_stack: &BTreeMap<i32, Id>,
    ) -> fmt::Result {
        writeln!(out, "Equivalence classes:")?;
        for (id, expr) in self.expression_classes.iter() {
            writeln!(out, "  {id}: {expr}")?;
        }
        writeln!(out, "Initial stack:")?;
        for (height, id) in initial_stack {
            writeln!(out, "  {height}: {id}")?;
        }
        writeln!(out, "Target stack:")?;
        for (height, id) in target_stack {
            writeln!(out, "  {height}: {id}")?;
        }
        writeln!(out, "Store operations:")?;
        for op in &self.store_operations {
            writeln!(out, "  {} slot={} value={} @{}", op.item, op.slot, op.value, op.seq)?;
        }
        Ok(())
    }

    // FEED PHASE
    // --------------------------------------------------------------------------------------------

    /// Feeds one item into the system for analysis.
    fn feed_item(&mut self, item: &AssemblyItem) -> Result<(), OptimizerError> {
        match item {
            AssemblyItem::Push(_) | AssemblyItem::PushTag(_) => {
                let id = self.expression_classes.find(item.clone(), Vec::new(), 0);
                self.push_class(id);
            },
            AssemblyItem::Tag(_) => {
                return Err(OptimizerError::internal("tag fed into basic block optimizer"));
            },
            AssemblyItem::Op(inst) => match *inst {
                Instruction::Dup(n) => {
                    let id = self.stack_element(self.stack_height - n as i32 + 1)?;
                    self.push_class(id);
                },
                Instruction::Swap(n) => {
                    self.swap_stack_elements(self.stack_height, self.stack_height - n as i32)?;
                },
                Instruction::Pop => {
                    // the element is forgotten, but it must exist
                    self.stack_element(self.stack_height)?;
                    self.stack_height -= 1;
                },
                Instruction::SLoad | Instruction::MLoad => self.load(item)?,
                Instruction::SStore | Instruction::MStore => self.store(item)?,
                _ if semantics::is_pure(item) => {
                    let operands = self.pop_operands(inst.info().args)?;
                    let id = self.expression_classes.find(item.clone(), operands, 0);
                    self.push_class(id);
                },
                _ => self.opaque_barrier(item)?,
            },
        }
        self.fed_items += 1;
        Ok(())
    }

    /// Retrieves the current value of the addressed slot, or creates a fresh sequence-stamped
    /// load class and remembers it as the slot's content.
    fn load(&mut self, item: &AssemblyItem) -> Result<(), OptimizerError> {
        let slot = self.pop_class()?;
        let is_storage = semantics::accesses_storage(item);
        let known = if is_storage {
            self.storage_content.get(&slot).copied()
        } else {
            self.memory_content.get(&slot).copied()
        };
        let value = match known {
            Some(value) => value,
            None => {
                let value =
                    self.expression_classes.find(item.clone(), vec![slot], self.sequence_number);
                if is_storage {
                    self.storage_content.insert(slot, value);
                } else {
                    self.memory_content.insert(slot, value);
                }
                value
            },
        };
        self.push_class(value);
        Ok(())
    }

    /// Increments the sequence number, deletes all knowledge about slots that might be
    /// overwritten, records the new binding, and appends the write to the log.
    fn store(&mut self, item: &AssemblyItem) -> Result<(), OptimizerError> {
        let slot = self.pop_class()?;
        let value = self.pop_class()?;
        self.sequence_number += 1;
        let content = if semantics::accesses_storage(item) {
            &mut self.storage_content
        } else {
            &mut self.memory_content
        };
        // only syntactically equal slots are provably distinct, so everything else goes
        content.clear();
        content.insert(slot, value);
        self.store_operations.push(StoreOperation {
            item: item.clone(),
            slot,
            seq: self.sequence_number,
            value,
        });
        Ok(())
    }

    /// Treats the item as an opaque impure operation: it invalidates all storage and memory
    /// knowledge and becomes a sequence-stamped class that cannot be merged across effectful
    /// boundaries. Unknown upstream opcodes take this path as well.
    fn opaque_barrier(&mut self, item: &AssemblyItem) -> Result<(), OptimizerError> {
        let info = match item.instruction() {
            Some(inst) => inst.info(),
            None => return Err(OptimizerError::internal("opaque barrier must be an operation")),
        };
        let operands = self.pop_operands(info.args)?;
        self.sequence_number += 1;
        self.storage_content.clear();
        self.memory_content.clear();
        let id = self.expression_classes.find(item.clone(), operands, self.sequence_number);
        if semantics::has_side_effects(item) {
            self.effectful_classes.push(id);
        }
        match info.out {
            0 => Ok(()),
            1 => {
                self.push_class(id);
                Ok(())
            },
            _ => Err(OptimizerError::internal("operations may push at most one result")),
        }
    }

    // STACK TRACKING
    // --------------------------------------------------------------------------------------------

    /// Retrieves the equivalence class of the stack element at the given height, creating the
    /// placeholder class for an untouched initial stack element on demand.
    fn stack_element(&mut self, height: i32) -> Result<Id, OptimizerError> {
        if let Some(&id) = self.stack_elements.get(&height) {
            return Ok(id);
        }
        self.initial_stack_element(height)
    }

    /// Returns the class of the initial stack element at the given non-positive height.
    fn initial_stack_element(&mut self, height: i32) -> Result<Id, OptimizerError> {
        if height > 0 {
            return Err(OptimizerError::internal("stack element created above the known stack"));
        }
        if height <= -(STACK_DEPTH_LIMIT as i32) {
            return Err(OptimizerError::StackUnderflow { offset: self.fed_items });
        }
        let id = self.expression_classes.entry_value(height);
        self.stack_elements.insert(height, id);
        Ok(id)
    }

    fn swap_stack_elements(&mut self, height_a: i32, height_b: i32) -> Result<(), OptimizerError> {
        let a = self.stack_element(height_a)?;
        let b = self.stack_element(height_b)?;
        self.stack_elements.insert(height_a, b);
        self.stack_elements.insert(height_b, a);
        Ok(())
    }

    fn push_class(&mut self, id: Id) {
        self.stack_height += 1;
        self.stack_elements.insert(self.stack_height, id);
    }

    fn pop_class(&mut self) -> Result<Id, OptimizerError> {
        let id = self.stack_element(self.stack_height)?;
        self.stack_height -= 1;
        Ok(id)
    }

    /// Pops the argument classes of an operation, topmost first.
    fn pop_operands(&mut self, count: usize) -> Result<Vec<Id>, OptimizerError> {
        let mut operands = Vec::with_capacity(count);
        for _ in 0..count {
            operands.push(self.pop_class()?);
        }
        Ok(operands)
    }
}

// TOP-LEVEL LOOP
// ================================================================================================

/// Optimizes a full instruction stream by splitting it at basic-block boundaries and running the
/// eliminator over each block.
///
/// A block whose optimization fails on an internal error keeps its original items; malformed
/// input (stack underflow) is surfaced to the caller.
#[instrument(skip_all, fields(items = items.len()))]
pub fn optimize_items(items: &[AssemblyItem]) -> Result<Vec<AssemblyItem>, OptimizerError> {
    let mut optimized = Vec::with_capacity(items.len());
    let mut rest = items;
    while !rest.is_empty() {
        let block_len =
            rest.iter().position(semantics::breaks_basic_block).unwrap_or(rest.len());
        let (block, tail) = rest.split_at(block_len);

        match optimize_block(block) {
            Ok(block_items) => {
                debug!(input = block.len(), output = block_items.len(), "optimized basic block");
                optimized.extend(block_items);
            },
            Err(err @ OptimizerError::StackUnderflow { .. }) => return Err(err),
            Err(err) => {
                warn!(%err, "keeping original items for basic block");
                optimized.extend_from_slice(block);
            },
        }

        match tail.split_first() {
            Some((boundary, remaining)) => {
                optimized.push(boundary.clone());
                rest = remaining;
            },
            None => rest = tail,
        }
    }
    Ok(optimized)
}

/// Optimizes a single basic block; the items must not contain a block boundary.
pub fn optimize_block(items: &[AssemblyItem]) -> Result<Vec<AssemblyItem>, OptimizerError> {
    let mut eliminator = CommonSubexpressionEliminator::new();
    let rest = eliminator.feed_items(items)?;
    debug_assert!(rest.is_empty(), "input must form a single basic block");
    eliminator.optimized_items()
}
