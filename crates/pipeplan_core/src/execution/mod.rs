//! Pipelined execution of stages on a single worker.

pub mod batch;
pub mod context;
pub mod functions;
pub mod operators;
pub mod pipeline;
pub mod scalar;
pub mod storage;
