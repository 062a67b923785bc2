//! # ladder-core
//! Types, storage contract, and the tree and ledger algorithms behind the
//! tier cascade: placement with overflow, ancestor resolution, first-or-second
//! eligibility, and the holding ledger.

pub mod catalog;
pub mod constants;
pub mod eligibility;
pub mod error;
pub mod ledger;
pub mod placement;
pub mod resolver;
pub mod store;
pub mod traits;
pub mod types;
