mod handlers;
mod routes;
mod state;
mod ws;

pub use handlers::{ApiError, ApiResponse};
pub use routes::create_router;
pub use state::AppState;
