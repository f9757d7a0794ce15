// ABOUTME: Root library module exposing the broker's HTTP surface
// ABOUTME: Server assembly, worker transport handlers, and the webhook adapter endpoint

pub mod server;
pub mod transport;
pub mod webhook;

// Re-export the platform-agnostic core modules
pub use tether_core::bus;
pub use tether_core::config;
pub use tether_core::error;
pub use tether_core::metrics;
pub use tether_core::protocol;
pub use tether_core::registry;
pub use tether_core::router;
