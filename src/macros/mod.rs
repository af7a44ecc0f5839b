//! Macro documents: model, validation, include expansion and loading.

pub mod include;
pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{MacroRegistry, MacroTable};
pub use model::{MacroDefinition, ParameterSpec, Step};
