pub mod passcode;
pub mod password;
pub mod verification;

pub use passcode::{MemoryPasscodeStore, PasscodeSession, PasscodeStore};
pub use password::{hash_password, verify_password};
pub use verification::{MemoryVerificationStore, VerificationChannel, VerificationStore};
