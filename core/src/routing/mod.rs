//! Routing
//!
//! Only link-local, single-hop routing is provided: a bundle whose
//! destination is a directly connected peer goes out on that peer's channel.

pub mod linklocal;

pub use linklocal::LinkLocalRouting;
