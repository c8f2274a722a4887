pub mod delegation;
pub mod document;
pub mod identity;
pub mod rule;
pub mod workflow;
