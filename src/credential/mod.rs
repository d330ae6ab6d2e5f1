pub mod classifier;
pub mod health;
pub mod manager;
pub mod store;
pub mod types;

pub use classifier::GeminiClassifier;
pub use manager::{Acquire, CredentialManager, QuotaStatusEntry};
