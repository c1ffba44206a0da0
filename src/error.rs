use crate::record::ParseError;
use crate::store::StoreError;
use crate::view::ViewDefinitionError;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("line {line}: {source}")]
    Record {
        line: u64,
        #[source]
        source: ParseError,
    },

    #[error("input has no header line")]
    EmptyInput,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    View(#[from] ViewDefinitionError),

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read delimited input: {0}")]
    Csv(#[from] csv::Error),
}
