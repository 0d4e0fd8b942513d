pub mod errors;
pub mod hr_sync;
pub mod ledger;
pub mod permissions;
pub mod strategy;
