//! Query module: request composition and the expectation table it produces.
//!
//! - [`composer`]: Builds query text from [FieldSpec] trees (QueryComposer, ComposedRequest)
//! - [`expectation`]: Per-`(response_key, level)` shape records consumed by [crate::normalize]

mod composer;
mod expectation;


pub use composer::{
    ComposedRequest, FieldSpec, OperationKind, Param, QueryComposer, ShapeMarker, VariableDecl,
};
pub use expectation::{Expectation, ExpectationKind, ExpectationTable};
