//! Request/response messages between a host and the session controller.
//!
//! Hosts (the C ABI, the JNI layer, tests) talk to a controller through
//! these plain values only. Lifecycle changes flow back as
//! [`SessionEvent`](crate::session::SessionEvent)s from `subscribe`.

use crate::backend::MediaBackend;
use crate::session::{SessionController, SessionId};
use crate::video::VideoError;

/// Status code carried across FFI boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    /// A required pointer argument was null
    NullPtr = 1,
    /// The locator was empty or not valid UTF-8
    InvalidLocator = 2,
    AlreadyActive = 3,
    NoVideoTrack = 4,
    SourceUnreadable = 5,
    ConfigureFailure = 6,
    /// Anything else, including caught panics
    Internal = 7,
}

impl ErrorCode {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ErrorCode::Ok,
            1 => ErrorCode::NullPtr,
            2 => ErrorCode::InvalidLocator,
            3 => ErrorCode::AlreadyActive,
            4 => ErrorCode::NoVideoTrack,
            5 => ErrorCode::SourceUnreadable,
            6 => ErrorCode::ConfigureFailure,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<&VideoError> for ErrorCode {
    fn from(e: &VideoError) -> Self {
        match e {
            VideoError::NoVideoTrack(_) => ErrorCode::NoVideoTrack,
            VideoError::SourceUnreadable(_) => ErrorCode::SourceUnreadable,
            VideoError::ConfigureFailure(_) => ErrorCode::ConfigureFailure,
            VideoError::AlreadyActive => ErrorCode::AlreadyActive,
            VideoError::DecodeLoopFault(_)
            | VideoError::IllegalState(_)
            | VideoError::SurfaceAbandoned
            | VideoError::ThreadSpawn(_) => ErrorCode::Internal,
        }
    }
}

impl From<VideoError> for ErrorCode {
    fn from(e: VideoError) -> Self {
        ErrorCode::from(&e)
    }
}

/// A command from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartDecoding { locator: String },
    StopDecoding,
    SetConsumerBufferSize { width: u32, height: u32 },
}

/// The controller's answer to a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Started { session: SessionId },
    Stopped,
    Ack,
    Rejected { code: ErrorCode },
}

impl Response {
    /// Status code of this response; `Ok` unless rejected.
    pub fn code(&self) -> ErrorCode {
        match self {
            Response::Rejected { code } => *code,
            _ => ErrorCode::Ok,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code() == ErrorCode::Ok
    }
}

impl<B: MediaBackend> SessionController<B> {
    /// Executes one host request.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::StartDecoding { locator } => {
                if locator.trim().is_empty() {
                    return Response::Rejected {
                        code: ErrorCode::InvalidLocator,
                    };
                }
                match self.start(&locator) {
                    Ok(session) => Response::Started { session },
                    Err(e) => Response::Rejected { code: e.into() },
                }
            }
            Request::StopDecoding => {
                self.stop_decoding();
                Response::Stopped
            }
            Request::SetConsumerBufferSize { width, height } => {
                match self.set_consumer_buffer_size(width, height) {
                    Ok(()) => Response::Ack,
                    Err(e) => Response::Rejected { code: e.into() },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use crate::config::DecodeConfig;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            ErrorCode::from(VideoError::NoVideoTrack("x".into())),
            ErrorCode::NoVideoTrack
        );
        assert_eq!(ErrorCode::from(VideoError::AlreadyActive).as_raw(), 3);
        assert_eq!(ErrorCode::from(VideoError::SurfaceAbandoned), ErrorCode::Internal);
        assert_eq!(ErrorCode::from_raw(6), ErrorCode::ConfigureFailure);
        assert_eq!(ErrorCode::from_raw(-9), ErrorCode::Internal);
    }

    #[test]
    fn test_handle_requests_without_session() {
        let controller = SessionController::new(ReferenceBackend::new(), DecodeConfig::default());

        assert_eq!(
            controller.handle(Request::StartDecoding {
                locator: String::new()
            }),
            Response::Rejected {
                code: ErrorCode::InvalidLocator
            }
        );
        assert_eq!(
            controller
                .handle(Request::StartDecoding {
                    locator: "missing/path.mp4".into()
                })
                .code(),
            ErrorCode::SourceUnreadable
        );
        assert_eq!(controller.handle(Request::StopDecoding), Response::Stopped);
        assert_eq!(
            controller
                .handle(Request::SetConsumerBufferSize {
                    width: 64,
                    height: 64
                })
                .code(),
            ErrorCode::Internal
        );
    }
}
