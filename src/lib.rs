pub mod crypto;
pub mod extract;
pub mod logging;
pub mod payload;
pub mod pipeline;
pub mod reconcile;
pub mod server;
pub mod storage;
pub mod synthesize;
pub mod upstream;
