#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

mod errors;
pub use errors::OptimizerError;

mod optimizer;
pub use optimizer::{
    CommonSubexpressionEliminator, StoreOperation,
    expression_classes::{Expr, ExpressionClasses, Id},
    optimize_block, optimize_items,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
