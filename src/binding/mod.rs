//! Binding Module - resolve input assignments to concrete values
//!
//! - `resolve`: [`resolve`] a single assignment against a [`ResolveScope`]
//!   (completed outputs, bypassed nodes, flow inputs)
//!
//! Resolution is pure: it reads the scope and never mutates it, so it is
//! safe to call from any thread and as often as needed.

mod resolve;

pub use resolve::{resolve, Bypass, BypassReason, Resolution, ResolveScope};
