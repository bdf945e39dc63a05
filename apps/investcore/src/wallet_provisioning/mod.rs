pub mod worker;

pub use worker::WalletProvisioningWorker;
