//! Line-delimited JSON protocol: one `Request` per stdin line, one
//! response object per stdout line. Handlers are grouped by method family.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
