//! A reference interpreter for the deterministic subset of Basalt assembly.
//!
//! The semantic-preservation tests execute a basic block and its optimized form from the same
//! concrete machine state and require both final states to be identical. Only items whose result
//! is a function of the machine state are supported; environment reads, calls and tags make
//! [`MachineState::execute`] return `None`.

use alloc::{collections::BTreeMap, vec::Vec};

use basalt_core::{AssemblyItem, Instruction, U256, arith, semantics};

// MACHINE STATE
// ================================================================================================

/// Concrete state of the Basalt VM: the operand stack plus word-addressed storage and memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineState {
    pub stack: Vec<U256>,
    pub storage: BTreeMap<U256, U256>,
    pub memory: BTreeMap<U256, U256>,
}

impl MachineState {
    /// Returns a state whose stack holds the given values, first value deepest.
    pub fn with_stack<I>(values: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        Self {
            stack: values.into_iter().map(U256::from).collect(),
            storage: BTreeMap::new(),
            memory: BTreeMap::new(),
        }
    }

    /// Executes the items on this state; returns `None` on stack underflow or on an item outside
    /// the deterministic subset.
    pub fn execute(&mut self, items: &[AssemblyItem]) -> Option<()> {
        for item in items {
            self.step(item)?;
        }
        Some(())
    }

    fn step(&mut self, item: &AssemblyItem) -> Option<()> {
        let inst = match item {
            AssemblyItem::Push(value) => {
                self.stack.push(*value);
                return Some(());
            },
            AssemblyItem::PushTag(_) | AssemblyItem::Tag(_) => return None,
            AssemblyItem::Op(inst) => *inst,
        };

        match inst {
            Instruction::Pop => {
                self.stack.pop()?;
            },
            Instruction::Dup(n) => {
                let index = self.stack.len().checked_sub(n as usize)?;
                let value = self.stack[index];
                self.stack.push(value);
            },
            Instruction::Swap(n) => {
                let top = self.stack.len().checked_sub(1)?;
                let other = self.stack.len().checked_sub(1 + n as usize)?;
                self.stack.swap(top, other);
            },
            Instruction::SLoad => {
                let slot = self.stack.pop()?;
                let value = self.storage.get(&slot).copied().unwrap_or_default();
                self.stack.push(value);
            },
            Instruction::SStore => {
                let slot = self.stack.pop()?;
                let value = self.stack.pop()?;
                self.storage.insert(slot, value);
            },
            Instruction::MLoad => {
                let slot = self.stack.pop()?;
                let value = self.memory.get(&slot).copied().unwrap_or_default();
                self.stack.push(value);
            },
            Instruction::MStore => {
                let slot = self.stack.pop()?;
                let value = self.stack.pop()?;
                self.memory.insert(slot, value);
            },
            _ => {
                let info = inst.info();
                if !semantics::is_pure(item) || info.out != 1 {
                    return None;
                }
                let mut args = Vec::with_capacity(info.args);
                for _ in 0..info.args {
                    args.push(self.stack.pop()?);
                }
                self.stack.push(arith::eval(inst, &args)?);
            },
        }
        Some(())
    }
}
