pub mod machine;

pub use machine::{OnboardingError, OnboardingEvent, OnboardingMachine};
