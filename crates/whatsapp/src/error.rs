use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceStoreError {
    #[error("device store: {0}")]
    Sled(#[from] sled::Error),

    #[error("device record encoding: {0}")]
    Codec(#[from] postcard::Error),

    #[error("device record key is not valid utf-8")]
    InvalidKey,
}
