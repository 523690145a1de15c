pub mod preflight;
pub mod request_id;

pub use preflight::preflight_no_content_middleware;
pub use request_id::request_id_middleware;
