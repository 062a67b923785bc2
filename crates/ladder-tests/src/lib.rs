//! Integration test suite for the Ladder tier cascade.
//!
//! Drives the engine end to end over both stores: multi-level cascades,
//! concurrent unlocks against one ancestor, money conservation under random
//! workloads, and restart persistence.

pub mod helpers;
