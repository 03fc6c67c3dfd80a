//! Process lifecycle primitives: spawning/terminating the encoder's child
//! process tree (`guardian`) and arbitrating exclusive device access across
//! independent tinycam instances (`device_lock`).

mod device_lock;
mod guardian;

pub use device_lock::DeviceLock;
pub use guardian::{Process, ProcessGuardian};
