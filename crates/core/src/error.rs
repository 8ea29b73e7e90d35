use thiserror::Error;

/// Errors raised while planning or running a cache load.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no loader factory registered under '{0}'")]
    UnknownFactory(String),

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("{class} has no attribute '{attribute}'")]
    MissingAttribute { class: String, attribute: String },

    #[error("failed to find index for relationship {relationship} ({attributes}); consider adding an index on the owner")]
    MissingIndex {
        relationship: String,
        attributes: String,
    },

    #[error("record source for {class} failed: {message}")]
    Source { class: String, message: String },

    #[error("{task} failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<LoadError>,
    },

    #[error("{task} panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("cache load aborted due to {count} error(s), first: {first}")]
    Aborted {
        count: usize,
        #[source]
        first: Box<LoadError>,
    },

    #[error("outstanding work count went negative ({0})")]
    CountUnderflow(i64),

    #[error("the engine is stopped")]
    EngineStopped,

    #[error("thread pools are frozen, cannot create pool '{0}'")]
    PoolsFrozen(String),
}

impl LoadError {
    /// Wrap this error with the description of the task that produced it.
    pub fn in_task(self, task: impl Into<String>) -> Self {
        LoadError::TaskFailed {
            task: task.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping task and abort wrappers.
    pub fn root(&self) -> &LoadError {
        match self {
            LoadError::TaskFailed { source, .. } => source.root(),
            LoadError::Aborted { first, .. } => first.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
