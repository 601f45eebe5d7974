//! # Calc expressions
//!
//! Small sandboxed expression language used for `calcExpression` on extra
//! channels and for `${...}` placeholders in act message templates.
//!
//! An expression sees exactly one binding, `value`, plus a handful of pure
//! functions (`abs`, `round`, `floor`, `ceil`, `min`, `max`, `str`, `num`).
//! Source length and nesting depth are capped, so evaluation always terminates.
//!
//! ```text
//! value * 1.8 + 32
//! value == 'on' ? 1 : 0
//! round(value / 1000, 2)
//! ```

pub mod evaluator;
pub mod template;

pub use evaluator::{ExprError, ExprValue, Expression};
pub use template::{render_template, strip_quotes, value_to_text};
