#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no providers are configured")]
    NotConfigured,

    #[error("model {0:?} is not served by any configured provider")]
    UnknownModel(String),

    #[error("no model satisfies the tool's requirements")]
    NoUsableModel,
}

pub type Result<T> = std::result::Result<T, Error>;
