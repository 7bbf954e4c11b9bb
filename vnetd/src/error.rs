use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timed out waiting for key {0}")]
    Timeout(String),

    #[error(transparent)]
    Command(#[from] vn_utils::cmd::CmdError),

    #[error("no allocation record for network {0}")]
    StateMissing(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to setup network {net}: {source}")]
    Setup {
        net: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("malformed store value at {key}: {err}")]
    BadValue { key: String, err: String },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn io(what: impl Into<String>, err: std::io::Error) -> Self {
        Error::Io(what.into(), err)
    }

    /// Wrap a phase failure with the name of the offending network.
    pub fn setup(net: impl Into<String>, source: Error) -> Self {
        Error::Setup {
            net: net.into(),
            source: Box::new(source),
        }
    }
}
