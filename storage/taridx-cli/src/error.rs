#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("{0}")]
    TaridxError(#[from] taridx::Error),
    #[error("{0}")]
    PatternError(#[from] glob::PatternError),
    #[error("{0}")]
    JoinError(#[from] tokio::task::JoinError),
}
