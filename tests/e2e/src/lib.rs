//! End-to-end test support for the Vidurai engine

pub mod harness;
