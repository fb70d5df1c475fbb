#![doc = include_str!("../README.md")]

mod allocator;
mod audit;
mod error;
mod file;
mod lock;
mod pool;
mod remote;
mod service;
mod source;
mod store;
mod validate;

#[cfg(test)]
mod tests;

pub use crate::allocator::*;
pub use crate::audit::*;
pub use crate::error::*;
pub use crate::file::*;
pub use crate::lock::*;
pub use crate::pool::*;
pub use crate::remote::{HttpRemoteClient, RemoteClient, RemoteError, RetryPolicy};
pub use crate::service::*;
pub use crate::source::*;
pub use crate::store::*;
pub use crate::validate::*;
