//! Core type aliases and re-exports

use std::future::Future;
use std::pin::Pin;

pub use glam::{Mat4, Vec3, Vec4};

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Owned, sendable future, used at the async boundary traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
