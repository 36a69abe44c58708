//! The intermediate representation.
//!
//! Two levels share one set of containers: the machine-independent
//! generic IR the driver constructs, and the x86-64 architecture IR the
//! lowering pass rewrites it into. Both are SSA: every value has exactly
//! one origin and an intrusive use-list supporting atomic
//! replace-all-uses rewrites.

pub mod block;
pub mod function;
pub mod instruction;
pub mod value;

pub use block::{BasicBlock, BlockId, Branch, EdgeData, EdgeId, PhiData, PhiId, PhiKind};
pub use function::Function;
pub use instruction::{BinaryMathOp, InstData, InstId, InstKind, UnaryMathOp};
pub use value::{OperandSize, Origin, Type, UseSite, ValueData, ValueId, ValueKind};
