//! Storage backend implementations.
//!
//! Each backend module provides a concrete type that implements
//! [`CsiIdentity`](crate::CsiIdentity) and [`CsiNode`](crate::CsiNode).

pub mod image;

pub use image::ImageBackend;
