use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("chat endpoint returned status {status} before any event"))]
    Network { stage: &'static str, status: u16 },
    #[snafu(display("stream protocol failure `{code}`: {details}"))]
    StreamProtocol {
        stage: &'static str,
        code: &'static str,
        details: String,
    },
    #[snafu(display("http request failed on `{stage}`: {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("transport base URL is empty"))]
    EmptyBaseUrl { stage: &'static str },
    #[snafu(display("unexpected chat transport failure: {message}"))]
    Unknown {
        stage: &'static str,
        message: String,
    },
}

impl TransportError {
    /// HTTP status for pre-stream failures, when known.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } => Some(*status),
            Self::StreamProtocol { .. }
            | Self::Http { .. }
            | Self::EmptyBaseUrl { .. }
            | Self::Unknown { .. } => None,
        }
    }

    /// Protocol failure code for mid-stream failures, when known.
    pub fn protocol_code(&self) -> Option<&'static str> {
        match self {
            Self::StreamProtocol { code, .. } => Some(code),
            Self::Network { .. }
            | Self::Http { .. }
            | Self::EmptyBaseUrl { .. }
            | Self::Unknown { .. } => None,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
