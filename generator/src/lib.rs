// rtigen — RTI Gauss-Newton solver generator
//
// Library root. Passes in pipeline order: validate, storage (plan),
// objective/constraints/rti (assembly), program (aggregation and
// verification), codegen. `eval` executes assembled programs in-process.

pub mod auxiliary;
pub mod codegen;
pub mod config;
pub mod constraints;
pub mod diag;
pub mod eval;
pub mod ir;
pub mod objective;
pub mod pass;
pub mod pipeline;
pub mod program;
pub mod rti;
pub mod storage;
pub mod validate;
