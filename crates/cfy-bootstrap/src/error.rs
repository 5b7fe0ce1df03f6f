#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provisioning error: {0}")]
    Infra(#[from] cfy_infra::Error),

    #[error("installation error: {0}")]
    Installer(#[from] cfy_installer::Error),

    #[error("process error: {0}")]
    Usm(#[from] cfy_usm::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("installation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
