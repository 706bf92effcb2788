use mx_codec::{CodecError, CodecId};
use mx_source::SourceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MuxerError>;

#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("no encoder available for {0}")]
    UnsupportedCodec(CodecId),

    #[error("muxer is already open")]
    AlreadyOpen,

    #[error("failed to open grab device: {0}")]
    OpenFailed(String),

    #[error("muxer is not open")]
    NotOpen,

    #[error("grabbing has been stopped")]
    GrabStopped,

    #[error("no media source selected")]
    NoSource,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Source(#[from] SourceError),
}
