//! Integration tests for the partition hash tree coordinator

mod exchange;
mod lock_lifecycle;
mod routing;
