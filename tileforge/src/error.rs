use std::io;

/// A convenience [`Result`] for the Tileforge server crate.
pub type TileforgeResult<T> = Result<T, TileforgeError>;

#[derive(thiserror::Error, Debug)]
pub enum TileforgeError {
    #[error("Unable to bind to {1}: {0}")]
    BindingError(io::Error, String),

    #[error("Unable to load configuration")]
    InvalidConfig,

    #[error("Invalid or missing '{0}' configuration section")]
    MissingConfigSection(&'static str),

    #[error("The '{0}' configuration source requires an external registry client; use json mode")]
    UnsupportedConfigSource(&'static str),

    #[error(transparent)]
    ConfigError(#[from] tileforge_core::config::ConfigError),

    #[error(transparent)]
    FilterError(#[from] crate::filters::FilterError),

    #[error(transparent)]
    WebError(#[from] actix_web::Error),

    #[error(transparent)]
    IoError(#[from] io::Error),
}
