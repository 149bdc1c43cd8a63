pub mod block;
pub mod bus;
pub mod capacity;
pub mod classify;
pub mod device;
pub mod error;
pub mod exec;
pub mod media;
pub mod retry;
pub mod sense;
