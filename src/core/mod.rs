pub mod auth;
pub mod errors;
pub mod feedback;
pub mod forward;
pub mod runtime;
pub mod server;
pub mod state;
pub mod surface;
pub mod upstream;
