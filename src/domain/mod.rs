pub mod allocation;
pub mod amount;
pub mod cycle_admission;
pub mod recovery_policy;
pub mod reputation;
pub mod status;
pub mod types;
