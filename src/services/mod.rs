pub mod coordinator;
pub mod gateway;
pub mod local_storage;
pub mod session_store;
pub mod signer;
