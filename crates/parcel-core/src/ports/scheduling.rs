//! Scheduling service port
//!
//! The intake side only needs to wake the scheduler; everything else about
//! scheduling is internal to the delivery crate.

pub trait ISchedulingService: Send + Sync {
    /// A new payload is available for delivery
    fn on_payload_intake(&self);
}
