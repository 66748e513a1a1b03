use std::fmt;

use thiserror::Error;

/// Errors returned by the tracer and the kernel objects it owns.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} is an unsupported OS, only \"linux\" is supported")]
    UnsupportedPlatform(&'static str),

    #[error("tracer must be created from within a tokio runtime")]
    NoRuntime,

    #[error("load BPF objects: {0}")]
    Load(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("BPF program {0:?} not found in object")]
    MissingProgram(&'static str),

    #[error("BPF map {0:?} not found in object")]
    MissingMap(&'static str),

    #[error("{op} BPF program {name:?}: {source}")]
    Program {
        op: &'static str,
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{op} BPF map {name:?}: {source}")]
    Map {
        op: &'static str,
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("attach tracepoint {category}/{name}: {source}")]
    Attach {
        category: &'static str,
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("open {name} ringbuf reader: {source}")]
    Reader {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The tracer was closed. Ends a read loop.
    #[error("tracer closed")]
    Closed,

    #[error("read from {name} ringbuf: {source}")]
    Read {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("parse raw ringbuf entry into {kind}: got {got} bytes, need {need}")]
    Decode {
        kind: &'static str,
        got: usize,
        need: usize,
    },

    /// Returned by every `close()` after the first one.
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    #[error("close {resource}: {errors}")]
    Close {
        resource: &'static str,
        errors: CloseErrors,
    },
}

impl Error {
    /// True for the expected end-of-stream signal of a read loop.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, Error::AlreadyClosed(_))
    }

    pub(crate) fn program<E>(op: &'static str, name: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Program {
            op,
            name,
            source: Box::new(source),
        }
    }

    pub(crate) fn map<E>(op: &'static str, name: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Map {
            op,
            name,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure collected while tearing down independent resources.
#[derive(Debug, Default)]
pub struct CloseErrors(Vec<Error>);

impl CloseErrors {
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok` when nothing failed, otherwise a composite [`Error::Close`].
    pub(crate) fn into_result(self, resource: &'static str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Close {
                resource,
                errors: self,
            })
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl IntoIterator for CloseErrors {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
