pub mod execution;
pub mod session;
