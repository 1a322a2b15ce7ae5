use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;

use basalt_core::{AssemblyItem, Instruction, U256, arith, semantics};

// CLASS ID
// ================================================================================================

/// Handle of an equivalence class of expressions.
///
/// Two ids are equal iff the values they denote are provably equal under the algebraic rules
/// applied at class construction time. Ids are dense and totally ordered; the operands of a class
/// always have smaller ids than the class itself, so the expression graph is acyclic by
/// construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u32);

impl Id {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// EXPRESSION
// ================================================================================================

/// The canonical expression of an equivalence class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// A value sitting on the stack when the basic block is entered, identified by its
    /// (non-positive) height relative to the entry stack top.
    EntryValue(i32),
    /// A computation: the representative assembly item, the classes of its arguments in stack
    /// order (topmost first), and the sequence number stamping operations whose result depends
    /// on when they execute relative to storage and memory writes (zero for unconstrained
    /// expressions).
    Computed {
        item: AssemblyItem,
        operands: Vec<Id>,
        seq: u32,
    },
}

impl Expr {
    /// Returns the operand classes of this expression.
    pub fn operands(&self) -> &[Id] {
        match self {
            Self::EntryValue(_) => &[],
            Self::Computed { operands, .. } => operands,
        }
    }

    /// Returns the sequence number of this expression; zero means the expression is not
    /// sequence-constrained.
    pub fn sequence_number(&self) -> u32 {
        match self {
            Self::EntryValue(_) => 0,
            Self::Computed { seq, .. } => *seq,
        }
    }

    /// Returns the representative assembly item, or `None` for an initial-stack placeholder.
    pub fn item(&self) -> Option<&AssemblyItem> {
        match self {
            Self::EntryValue(_) => None,
            Self::Computed { item, .. } => Some(item),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryValue(height) => write!(f, "<entry {height}>"),
            Self::Computed { item, operands, seq } => {
                write!(f, "{item}(")?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{operand}")?;
                }
                write!(f, ")")?;
                if *seq != 0 {
                    write!(f, " @{seq}")?;
                }
                Ok(())
            },
        }
    }
}

// EXPRESSION CLASSES
// ================================================================================================

/// Structure containing the classes of equivalent expressions within one basic block.
///
/// Classes are stored in an arena and identified by dense [`Id`]s. Equivalence is realized by
/// canonicalization at construction time: commutative operands are sorted, algebraic identities
/// and constants are rewritten to a fixed point, and the result is hash-consed, so two
/// structurally equal expressions always receive the same id. No union operation exists after
/// construction.
#[derive(Clone, Debug, Default)]
pub struct ExpressionClasses {
    exprs: Vec<Expr>,
    pure: Vec<bool>,
    by_expr: BTreeMap<(AssemblyItem, Vec<Id>, u32), Id>,
    entry_values: BTreeMap<i32, Id>,
}

impl ExpressionClasses {
    /// Returns the id of the class containing the expression formed by the item and the given
    /// operand classes, allocating a fresh class if no equal expression is known.
    ///
    /// Operands are given in stack order (topmost first). A nonzero `seq` stamps the expression
    /// as sequence-constrained; such expressions are neither folded nor simplified, and two
    /// occurrences are only merged when their stamps agree.
    pub fn find(&mut self, item: AssemblyItem, mut operands: Vec<Id>, seq: u32) -> Id {
        if semantics::is_commutative(&item) {
            operands.sort();
        }
        if seq == 0 {
            if let Some(id) = self.fold_constants(&item, &operands) {
                return id;
            }
            if let Some(id) = self.simplify(&item, &operands) {
                return id;
            }
        }

        let key = (item, operands, seq);
        if let Some(&id) = self.by_expr.get(&key) {
            return id;
        }

        let (item, operands, seq) = key;
        let pure =
            seq == 0 && semantics::is_pure(&item) && operands.iter().all(|&op| self.is_pure(op));
        let id = self.insert(Expr::Computed { item: item.clone(), operands: operands.clone(), seq }, pure);
        self.by_expr.insert((item, operands, seq), id);
        id
    }

    /// Returns the placeholder class for the initial stack element at the given height (must not
    /// be positive). The same height always yields the same class.
    pub fn entry_value(&mut self, height: i32) -> Id {
        debug_assert!(height <= 0, "entry values exist at non-positive heights only");
        if let Some(&id) = self.entry_values.get(&height) {
            return id;
        }
        let id = self.insert(Expr::EntryValue(height), true);
        self.entry_values.insert(height, id);
        id
    }

    /// Returns the canonical expression of the given class.
    pub fn representative(&self, id: Id) -> &Expr {
        &self.exprs[id.index()]
    }

    /// Returns the literal value of the class if it is a push constant.
    pub fn known_constant(&self, id: Id) -> Option<&U256> {
        match &self.exprs[id.index()] {
            Expr::Computed { item: AssemblyItem::Push(value), .. } => Some(value),
            _ => None,
        }
    }

    /// Returns true if the value of the class depends only on the values of its transitive
    /// operands (no sequence constraint anywhere in its expression tree).
    pub fn is_pure(&self, id: Id) -> bool {
        self.pure[id.index()]
    }

    /// Returns the number of known classes.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    /// Returns true if no classes have been created yet.
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Returns an iterator over all classes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (Id, &Expr)> {
        self.exprs.iter().enumerate().map(|(i, expr)| (Id(i as u32), expr))
    }

    fn insert(&mut self, expr: Expr, pure: bool) -> Id {
        let id = Id(self.exprs.len() as u32);
        debug_assert!(expr.operands().iter().all(|op| *op < id));
        self.exprs.push(expr);
        self.pure.push(pure);
        id
    }

    // SIMPLIFICATION
    // --------------------------------------------------------------------------------------------

    /// Evaluates the expression if all operands are literal constants; returns the class of the
    /// resulting push constant.
    fn fold_constants(&mut self, item: &AssemblyItem, operands: &[Id]) -> Option<Id> {
        let AssemblyItem::Op(inst) = item else { return None };
        let values = operands
            .iter()
            .map(|&op| self.known_constant(op).copied())
            .collect::<Option<Vec<_>>>()?;
        let result = arith::eval(*inst, &values)?;
        Some(self.constant_class(result))
    }

    /// Applies the algebraic identity, zero and self-cancellation rules; returns the rewritten
    /// class if one applies. The rule set maps every expression to an operand or to a constant,
    /// so a single application reaches the fixed point.
    fn simplify(&mut self, item: &AssemblyItem, operands: &[Id]) -> Option<Id> {
        use Instruction::*;

        let AssemblyItem::Op(inst) = item else { return None };
        let (a, b) = match *operands {
            [a, b] => (a, b),
            _ => return None,
        };

        match *inst {
            Add => self.other_if_constant(a, b, U256::zero()),
            Mul => {
                if self.constant_is(a, U256::zero()) || self.constant_is(b, U256::zero()) {
                    return Some(self.constant_class(U256::zero()));
                }
                self.other_if_constant(a, b, U256::one())
            },
            Sub if a == b => Some(self.constant_class(U256::zero())),
            And => {
                if self.constant_is(a, U256::zero()) || self.constant_is(b, U256::zero()) {
                    return Some(self.constant_class(U256::zero()));
                }
                if a == b {
                    return Some(a);
                }
                self.other_if_constant(a, b, U256::MAX)
            },
            Or => {
                if a == b {
                    return Some(a);
                }
                self.other_if_constant(a, b, U256::zero())
            },
            Xor => {
                if a == b {
                    return Some(self.constant_class(U256::zero()));
                }
                self.other_if_constant(a, b, U256::zero())
            },
            // comparing a value against itself is only sound when the value is unconstrained by
            // sequencing; a stamped class read again after a write is a different expression
            Eq if a == b && self.is_pure(a) => Some(self.constant_class(U256::one())),
            _ => None,
        }
    }

    /// Returns the other operand if one of the two is the given literal.
    fn other_if_constant(&self, a: Id, b: Id, value: U256) -> Option<Id> {
        if self.constant_is(a, value) {
            return Some(b);
        }
        if self.constant_is(b, value) {
            return Some(a);
        }
        None
    }

    fn constant_is(&self, id: Id, value: U256) -> bool {
        self.known_constant(id) == Some(&value)
    }

    fn constant_class(&mut self, value: U256) -> Id {
        self.find(AssemblyItem::Push(value), Vec::new(), 0)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn op(inst: Instruction) -> AssemblyItem {
        AssemblyItem::Op(inst)
    }

    fn setup() -> (ExpressionClasses, Id, Id) {
        let mut classes = ExpressionClasses::default();
        let x = classes.entry_value(0);
        let y = classes.entry_value(-1);
        (classes, x, y)
    }

    #[test]
    fn hash_consing_yields_identical_ids() {
        let (mut classes, x, y) = setup();
        let first = classes.find(op(Instruction::Sub), vec![x, y], 0);
        let second = classes.find(op(Instruction::Sub), vec![x, y], 0);
        assert_eq!(first, second);
        // operand order matters for non-commutative operations
        let swapped = classes.find(op(Instruction::Sub), vec![y, x], 0);
        assert_ne!(first, swapped);
    }

    #[test]
    fn commutative_operands_are_normalized() {
        let (mut classes, x, y) = setup();
        let first = classes.find(op(Instruction::Add), vec![x, y], 0);
        let second = classes.find(op(Instruction::Add), vec![y, x], 0);
        assert_eq!(first, second);
    }

    #[test]
    fn entry_values_are_memoized_per_height() {
        let (mut classes, x, y) = setup();
        assert_eq!(classes.entry_value(0), x);
        assert_eq!(classes.entry_value(-1), y);
        assert_ne!(x, y);
    }

    #[test]
    fn constants_fold_to_push_classes() {
        let mut classes = ExpressionClasses::default();
        let seven = classes.find(AssemblyItem::push(7), vec![], 0);
        let three = classes.find(AssemblyItem::push(3), vec![], 0);
        let sum = classes.find(op(Instruction::Add), vec![seven, three], 0);
        assert_eq!(classes.known_constant(sum), Some(&U256::from(10u64)));
        // the folded class is the same class a literal push would get
        assert_eq!(sum, classes.find(AssemblyItem::push(10), vec![], 0));
    }

    #[rstest]
    #[case(Instruction::Add, 0)]
    #[case(Instruction::Or, 0)]
    #[case(Instruction::Xor, 0)]
    fn identity_with_zero_returns_operand(#[case] inst: Instruction, #[case] constant: u64) {
        let (mut classes, x, _) = setup();
        let c = classes.find(AssemblyItem::push(constant), vec![], 0);
        assert_eq!(classes.find(op(inst), vec![x, c], 0), x);
        assert_eq!(classes.find(op(inst), vec![c, x], 0), x);
    }

    #[test]
    fn multiplicative_identities() {
        let (mut classes, x, _) = setup();
        let zero = classes.find(AssemblyItem::push(0), vec![], 0);
        let one = classes.find(AssemblyItem::push(1), vec![], 0);
        assert_eq!(classes.find(op(Instruction::Mul), vec![x, one], 0), x);
        assert_eq!(classes.find(op(Instruction::Mul), vec![x, zero], 0), zero);
    }

    #[test]
    fn and_with_all_ones_returns_operand() {
        let (mut classes, x, _) = setup();
        let ones = classes.find(AssemblyItem::Push(U256::MAX), vec![], 0);
        assert_eq!(classes.find(op(Instruction::And), vec![x, ones], 0), x);
        let zero = classes.find(AssemblyItem::push(0), vec![], 0);
        assert_eq!(classes.find(op(Instruction::And), vec![x, zero], 0), zero);
    }

    #[test]
    fn self_cancellation_rules() {
        let (mut classes, x, _) = setup();
        let zero = classes.find(AssemblyItem::push(0), vec![], 0);
        assert_eq!(classes.find(op(Instruction::Sub), vec![x, x], 0), zero);
        assert_eq!(classes.find(op(Instruction::Xor), vec![x, x], 0), zero);
        assert_eq!(classes.find(op(Instruction::And), vec![x, x], 0), x);
        assert_eq!(classes.find(op(Instruction::Or), vec![x, x], 0), x);
    }

    #[test]
    fn eq_on_itself_requires_purity() {
        let (mut classes, x, _) = setup();
        let one = classes.find(AssemblyItem::push(1), vec![], 0);
        assert_eq!(classes.find(op(Instruction::Eq), vec![x, x], 0), one);

        // a sequence-stamped load compared against itself is left alone
        let slot = classes.find(AssemblyItem::push(5), vec![], 0);
        let load = classes.find(op(Instruction::SLoad), vec![slot], 3);
        let cmp = classes.find(op(Instruction::Eq), vec![load, load], 0);
        assert_ne!(cmp, one);
        assert_eq!(classes.representative(cmp).operands(), &[load, load]);
    }

    #[test]
    fn sequence_stamps_separate_classes() {
        let (mut classes, x, _) = setup();
        let early = classes.find(op(Instruction::SLoad), vec![x], 1);
        let late = classes.find(op(Instruction::SLoad), vec![x], 2);
        assert_ne!(early, late);
        assert_eq!(classes.find(op(Instruction::SLoad), vec![x], 1), early);
        assert!(!classes.is_pure(early));
    }

    #[test]
    fn purity_is_transitive() {
        let (mut classes, x, _) = setup();
        let load = classes.find(op(Instruction::SLoad), vec![x], 1);
        let one = classes.find(AssemblyItem::push(1), vec![], 0);
        let pure_sum = classes.find(op(Instruction::Add), vec![x, one], 0);
        let tainted = classes.find(op(Instruction::Add), vec![load, one], 0);
        assert!(classes.is_pure(x));
        assert!(classes.is_pure(pure_sum));
        assert!(!classes.is_pure(tainted));
    }

    #[test]
    fn operands_precede_their_users() {
        let (mut classes, x, y) = setup();
        let sum = classes.find(op(Instruction::Add), vec![x, y], 0);
        for operand in classes.representative(sum).operands() {
            assert!(*operand < sum);
        }
    }
}
