//! # Car library.
//!
//! This library holds the components of the car executable, so that they can be driven by the
//! integration tests and by other crates in the workspace.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Actuator drivers - drive motors and camera servos
pub mod actuator;

/// Bounded channels connecting the car's tasks
pub mod channel;

/// Command dispatcher - applies commands to the actuators
pub mod cmd_dispatch;

/// Command ingress - turns control messages into commands
pub mod cmd_ingress;

/// Frame source - camera capture into a fixed pool of frame buffers
pub mod frame;

/// Frame pipeline - moves captured frames into the frame channel
pub mod frame_pipeline;

/// Car executable parameters
pub mod params;

/// Network server reactor
pub mod server;

/// Streaming and telemetry sessions
pub mod session;

/// Counted signals
pub mod signal;

/// Telemetry sources and the telemetry sampler
pub mod tm;

/// Async admission worker pool
pub mod worker_pool;
