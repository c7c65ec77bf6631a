#[macro_use]
mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod context;
pub mod filter;
pub mod http;
pub mod lb;
pub mod listener;
pub mod matcher;
pub mod metrics;
pub mod predicate;
pub mod route;
pub mod routing;
pub mod util;
