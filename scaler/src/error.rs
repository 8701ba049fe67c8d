/// Errors surfaced by a scale run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A resource the run depends on does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Transport or API failure talking to the cluster.
    #[error("Kube error: {source}")]
    Kube {
        /// Underlying client error.
        #[from]
        source: kube::Error,
    },
    /// A cluster object could not be decoded.
    #[error("Decode error: {source}")]
    Decode {
        /// Underlying decode error.
        #[from]
        source: serde_json::Error,
    },
    /// The managed control plane CLI failed.
    #[error("Managed CLI error: {source}")]
    Cli {
        /// Underlying CLI failure.
        source: anyhow::Error,
    },
    /// Documents could not be written to the sink.
    #[error("Indexing error: {source}")]
    Indexing {
        /// Underlying sink failure.
        source: anyhow::Error,
    },
    /// Any other failure.
    #[error("App error: {source}")]
    App {
        /// Underlying error.
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    /// Report whether the error means the resource is missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube { source } => crate::utils::is_not_found(source),
            _ => false,
        }
    }
}
