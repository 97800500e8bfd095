//! Application logic: registry state machine, statistics, rate control,
//! session state, the outbound task queue, and port traits.

pub mod addr_pool;
pub mod ports;
pub mod rate;
pub mod registry;
pub mod session;
pub mod task_queue;
pub mod tracker;
