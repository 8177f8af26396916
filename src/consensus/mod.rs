//! Grade consensus.
//!
//! Reduces several independent AI grading passes for one question into a
//! single trusted result, or defers the question to a human reviewer.

pub mod finalizer;

pub use finalizer::*;
