// Error model shared by the codec, the client and the server handlers.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Handshake,
    Cursor,
    PartitionNotFound,
    Token,
    Transport,
    Decode,
    Publisher,
    Usage,
    Io,
    Internal,
}

impl ErrorKind {
    /// Status a server answers with when a request fails with this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Handshake
            | ErrorKind::Cursor
            | ErrorKind::PartitionNotFound
            | ErrorKind::Usage => 400,
            ErrorKind::Token => 409,
            ErrorKind::Transport
            | ErrorKind::Decode
            | ErrorKind::Publisher
            | ErrorKind::Io
            | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    status: Option<u16>,
    partition: Option<i64>,
    mock_status: Option<u16>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            status: None,
            partition: None,
            mock_status: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// HTTP status received (client side) or to be sent (server side).
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn partition(&self) -> Option<i64> {
        self.partition
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_partition(mut self, partition: i64) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn handshake_partition_count_missing() -> Self {
        Error::new(ErrorKind::Handshake).with_message("handshake error: partition count missing")
    }

    pub fn handshake_partition_count_mismatch() -> Self {
        Error::new(ErrorKind::Handshake).with_message("handshake error: partition count mismatch")
    }

    pub fn cursors_missing() -> Self {
        Error::new(ErrorKind::Cursor).with_message("cursors are missing")
    }

    pub fn too_many_cursors() -> Self {
        Error::new(ErrorKind::Cursor)
            .with_message("support for multiple cursors in the same request has been removed")
    }

    pub fn partition_not_found(partition: i64) -> Self {
        Error::new(ErrorKind::PartitionNotFound)
            .with_message("partition doesn't exist")
            .with_partition(partition)
    }

    pub fn illegal_token() -> Self {
        Error::new(ErrorKind::Token)
            .with_message("illegal token, please fetch new from discovery endpoint")
    }

    /// Reserved publisher failure for mock feeds: answered with 500 and `message` as body.
    pub fn mock_internal(message: impl Into<String>) -> Self {
        let mut err = Error::new(ErrorKind::Publisher).with_message(message);
        err.mock_status = Some(500);
        err
    }

    /// Reserved publisher failure for mock feeds: answered with 504 and a blank body.
    pub fn mock_gateway_timeout() -> Self {
        let mut err = Error::new(ErrorKind::Publisher).with_message("");
        err.mock_status = Some(504);
        err
    }

    pub fn mock_status(&self) -> Option<u16> {
        self.mock_status
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(status) = self.status {
            write!(f, ": response code {status}")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(partition) = self.partition {
            write!(f, " (partition: {partition})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Process exit code for a CLI run that failed with `kind`.
pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal | ErrorKind::Publisher => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Handshake | ErrorKind::Cursor | ErrorKind::PartitionNotFound => 3,
        ErrorKind::Token => 4,
        ErrorKind::Transport => 5,
        ErrorKind::Decode => 6,
        ErrorKind::Io => 8,
    }
}
