pub type BackdropResult<T> = Result<T, BackdropError>;

#[derive(thiserror::Error, Debug)]
pub enum BackdropError {
    /// Rejected at pipeline/session construction time; no partial pipeline
    /// is ever returned alongside this.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("render error: {0}")]
    Render(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackdropError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }
}
