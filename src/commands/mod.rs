pub mod config;
pub mod doctor;
pub mod sessions;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Errors related to netscope's own config.json
    #[error("Config error: {0}")]
    Config(String),
    /// Errors while reading or interpreting recorded session archives
    #[error("Archive error: {0}")]
    Archive(String),
    /// Generic fallback for other failures
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(format!("{e:#}"))
    }
}
