// Domain layer: roster and account models plus the ports adapters implement.

pub mod model;
pub mod ports;
