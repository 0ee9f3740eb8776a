use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostlensError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Layout error: {0}")]
    Layout(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
