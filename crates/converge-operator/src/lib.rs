//! NewResource controller.

pub mod reconciler;
pub mod resource;
