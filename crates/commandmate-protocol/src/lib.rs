//! Wire types shared by the CommandMate server and its clients.

mod client;
pub mod events;
mod records;
mod requests;

pub use client::ApiClient;
pub use events::{Envelope, EventKind};
pub use records::*;
pub use requests::*;
