use std::fmt;

#[derive(Debug)]
pub enum MapmergeError {
    Decode(String),
    ReferenceNotFound(String),
    MergeFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    UploadFailed {
        status: u16,
        body: String,
    },
    Connection(String),
    Io(std::io::Error),
}

impl MapmergeError {
    /// Stable machine-readable tag for branching on the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            MapmergeError::Decode(_) => "decode",
            MapmergeError::ReferenceNotFound(_) => "reference-not-found",
            MapmergeError::MergeFailed { .. } => "merge-failed",
            MapmergeError::UploadFailed { .. } => "upload-failed",
            MapmergeError::Connection(_) => "connection",
            MapmergeError::Io(_) => "io",
        }
    }
}

impl fmt::Display for MapmergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapmergeError::Decode(e) => write!(f, "Decode error: {}", e),
            MapmergeError::ReferenceNotFound(r) => {
                write!(f, "Wafermap with reference {} was not found in the datastore", r)
            }
            MapmergeError::MergeFailed {
                exit_code,
                stdout,
                stderr,
            } => write!(
                f,
                "Merge tool exited with code {}\nstdout: {}\nstderr: {}",
                exit_code, stdout, stderr
            ),
            MapmergeError::UploadFailed { status, body } => {
                write!(f, "Unable to push wafermap to the datastore: {} - {}", status, body)
            }
            MapmergeError::Connection(e) => write!(f, "Connection error: {}", e),
            MapmergeError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for MapmergeError {}

impl From<std::io::Error> for MapmergeError {
    fn from(err: std::io::Error) -> Self {
        MapmergeError::Io(err)
    }
}

impl From<quick_xml::Error> for MapmergeError {
    fn from(err: quick_xml::Error) -> Self {
        MapmergeError::Decode(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for MapmergeError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        MapmergeError::Decode(err.to_string())
    }
}

impl From<quick_xml::escape::EscapeError> for MapmergeError {
    fn from(err: quick_xml::escape::EscapeError) -> Self {
        MapmergeError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for MapmergeError {
    fn from(err: base64::DecodeError) -> Self {
        MapmergeError::Decode(format!("invalid base64 payload: {}", err))
    }
}

impl From<reqwest::Error> for MapmergeError {
    fn from(err: reqwest::Error) -> Self {
        MapmergeError::Connection(err.to_string())
    }
}

impl From<amiquip::Error> for MapmergeError {
    fn from(err: amiquip::Error) -> Self {
        MapmergeError::Connection(err.to_string())
    }
}
