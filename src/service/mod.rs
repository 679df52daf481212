//! # Service Layer
//!
//! The connection manager and the collaborators it is built from.
//!
//! ## Components
//! - **Manager**: actor task owning the connection, with a cloneable handle
//! - **Correlation**: request IDs, pending request tables and their timers
//! - **Events**: observer registries with RAII unsubscribe
//! - **Credentials**: secure store and identity token provider traits

pub mod correlation;
pub mod credentials;
pub mod events;
pub mod manager;
