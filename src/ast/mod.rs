//! AST Module - parsed flow definitions
//!
//! - `assignment`: InputAssignment, the `${...}` value-expression grammar
//! - `flow`: Flow, Node, SkipCondition, ActivateCondition, FlowInputDef
//!
//! These types are the static structure parsed from YAML. For execution,
//! see `dag` and `runtime`.

mod assignment;
mod flow;

pub use assignment::{InputAssignment, INPUTS_SECTION, OUTPUT_SECTION};
pub use flow::{ActivateCondition, Flow, FlowInputDef, Node, SkipCondition};
