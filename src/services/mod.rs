pub mod events;
pub mod queue;
pub mod retry;
pub mod store;
pub mod transcode;
pub mod worker;
