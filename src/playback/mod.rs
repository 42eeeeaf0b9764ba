#[cfg(feature = "cpal")]
pub mod device;
pub mod engine;
pub mod output;
pub mod paced;
pub mod session;
