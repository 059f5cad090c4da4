mod catalog;
mod customer;
mod entitlement;
mod ledger;
mod license;
mod trial;

pub use catalog::*;
pub use customer::*;
pub use entitlement::*;
pub use ledger::*;
pub use license::*;
pub use trial::*;
