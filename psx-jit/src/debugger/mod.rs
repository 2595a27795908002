//! Debugger collaborators: breakpoints, their condition expressions and
//! the symbol map.

pub mod breakpoints;
pub mod expression;
pub mod symbols;

pub use breakpoints::{BreakAction, Breakpoint, BreakpointTable};
pub use expression::{Expression, ExpressionError};
pub use symbols::{FunctionSymbol, SymbolMap};
