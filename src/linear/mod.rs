//! Linearized factors and symmetric block accumulation
//!
//! One linearization round turns every measurement factor into a
//! [`BlockLinearFactor`]; a [`SlotAssignment`] maps variable keys to
//! contiguous block indices; folding every factor's quadratic form into a
//! [`BlockInfoMatrix`] yields the Gauss-Newton normal equations. For
//! matrix-free iterative solvers, [`RegularBlockFactor`] provides
//! Hessian-vector products and Hessian diagonals over fixed-width blocks
//! without ever materializing the assembled matrix.

pub mod block_factor;
pub mod info;
pub mod regular;
pub mod slots;

pub use block_factor::BlockLinearFactor;
pub use info::BlockInfoMatrix;
pub use regular::{RegularBlock, RegularBlockFactor, VariableLayout};
pub use slots::SlotAssignment;
