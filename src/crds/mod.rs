mod gateway;
mod mapping;
mod service_monitor;

pub use gateway::*;
pub use mapping::*;
pub use service_monitor::*;
