//! Seeded fixtures shared by the workspace's tests: header-chain and
//! transaction generators built on `fastrand`, the same crate the rest of
//! the workspace already uses for its own randomness.
pub mod block;
pub mod tx;
