//! Sketch types consumed by the search engines.
//!
//! Only scaled (FracMinHash) sketches are supported: every comparison in
//! this crate needs containment, which `num` sketches cannot estimate.

pub mod minhash;
