//! Runtime implementations of `[common::runtime::Runtime]`: a production
//! implementation backed by a real Tokio executor and the wall clock, and a
//! deterministic implementation for tests.
pub mod prod;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
