use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Missing required header: #{0}")]
    MissingHeader(&'static str),

    #[error("Line {line}: invalid value for #{key}: {value:?}")]
    InvalidHeader {
        line: usize,
        key: String,
        value: String,
    },

    #[error("Line {line}: unrecognized line {content:?}")]
    InvalidLine { line: usize, content: String },

    #[error("Notes file contains no notes")]
    NoNotes,

    #[error("Character {0:?} cannot be represented in the target encoding")]
    Unencodable(char),

    #[error("Image processing error: {0}")]
    ImageError(String),
}

impl MetadataError {
    /// 1-based line number for parse errors
    pub fn line(&self) -> Option<usize> {
        match self {
            MetadataError::InvalidHeader { line, .. } | MetadataError::InvalidLine { line, .. } => {
                Some(*line)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MetadataError>;
