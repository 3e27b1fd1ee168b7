//! Query and dashboard parameters.
//!
//! This module provides:
//! - [`Parameter`]: value model with normalization and URL encoding
//! - Dependent option loading plus the [`OptionRequestGuard`]
//! - [`CascadeResolver`]: propagation of a change through dependents
//! - [`ParameterSetController`]: the live parameter set
//! - [`ParameterizedQuery`]: value validation and template rendering

mod cascade;
mod controller;
mod loader;
mod parameter;
mod url;
mod validation;

pub use cascade::*;
pub use controller::*;
pub use loader::*;
pub use parameter::*;
pub use url::*;
pub use validation::*;
