pub mod handlers;
pub mod response;
pub mod routes;

pub use routes::create_router;

/// Request header carrying the calling owner's id.
pub const OWNER_HEADER: &str = "x-owner-id";
