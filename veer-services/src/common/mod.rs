mod context;
mod panic;

pub use context::ContextService;
pub(crate) use panic::payload_text as panic_payload_text;
pub use panic::{CatchPanicError, CatchPanicService};
