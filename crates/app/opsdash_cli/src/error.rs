use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO::{:?}: {}", .0, .0)]
    Io(#[from] std::io::Error),

    #[error("{}", .0)]
    Auth(#[from] opsdash_core::auth::AuthError),

    #[error("Json::{:?}: {}", .0, .0)]
    Json(#[from] serde_json::Error),

    #[error("LogFilter: {}", .0)]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logging: {}", .0)]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}
