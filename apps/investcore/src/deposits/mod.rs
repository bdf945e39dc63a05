mod pipeline;
mod store;

pub use pipeline::{DepositOutcome, DepositPipeline};
pub use store::{Deposit, DepositStatus, DepositStore, MemoryDepositStore, PostgresDepositStore};
