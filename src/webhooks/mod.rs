pub mod defaulter;
pub mod server;
pub mod validator;

pub use server::{build_webhook_router, serve, WebhookState};
