/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use core::{array::TryFromSliceError, fmt};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    // AEAD tag mismatch on a received message
    AuthenticationFailed,
    Busy,
    // The outgoing message counter would wrap
    CounterExhausted,
    Crypto,
    HandshakeFailed,
    Invalid,
    InvalidData,
    InvalidOpcode,
    InvalidProto,
    InvalidSignature,
    InvalidState,
    InvalidVersion,
    KeysAlreadySet,
    NoSession,
    NoSharedTrustRoots,
    NoSpace,
    NoSpaceExchanges,
    NoSpaceSessions,
    NotFound,
    StaleCounter,
    StdIoError,
    SysTimeFail,
    Timeout,
    TLVNotFound,
    TLVTypeMismatch,
    TransportFailure,
    TruncatedPacket,
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

pub struct Error {
    code: ErrorCode,
    #[cfg(all(feature = "std", feature = "backtrace"))]
    backtrace: std::backtrace::Backtrace,
    #[cfg(all(feature = "std", feature = "backtrace"))]
    inner: Option<Box<dyn std::error::Error + Send>>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            #[cfg(all(feature = "std", feature = "backtrace"))]
            backtrace: std::backtrace::Backtrace::capture(),
            #[cfg(all(feature = "std", feature = "backtrace"))]
            inner: None,
        }
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub fn new_with_details(
        code: ErrorCode,
        detailed_err: Box<dyn std::error::Error + Send>,
    ) -> Self {
        Self {
            code,
            backtrace: std::backtrace::Backtrace::capture(),
            inner: Some(detailed_err),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub const fn backtrace(&self) -> &std::backtrace::Backtrace {
        &self.backtrace
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub fn details(&self) -> Option<&(dyn std::error::Error + Send)> {
        self.inner.as_ref().map(|err| err.as_ref())
    }

    pub fn remap<F>(self, matcher: F, to: Self) -> Self
    where
        F: FnOnce(&Self) -> bool,
    {
        if matcher(&self) {
            to
        } else {
            self
        }
    }

    /// Collapse all parse-level failures into `to`.
    ///
    /// Used by the handshakes, where any malformed payload is reported to the
    /// peer the same way.
    pub fn map_invalid(self, to: Self) -> Self {
        self.remap(
            |e| {
                matches!(
                    e.code(),
                    ErrorCode::Invalid
                        | ErrorCode::InvalidData
                        | ErrorCode::TLVNotFound
                        | ErrorCode::TLVTypeMismatch
                        | ErrorCode::TruncatedPacket
                )
            },
            to,
        )
    }

    /// Return `true` if the error is a cryptographic authentication failure,
    /// i.e. something which must never be retried with the same material.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::AuthenticationFailed | ErrorCode::InvalidSignature
        )
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

#[cfg(all(feature = "std", feature = "backtrace"))]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new_with_details(ErrorCode::StdIoError, Box::new(e))
    }
}

#[cfg(all(feature = "std", not(feature = "backtrace")))]
impl From<std::io::Error> for Error {
    fn from(_e: std::io::Error) -> Self {
        Self::new(ErrorCode::StdIoError)
    }
}

#[cfg(feature = "std")]
impl From<std::time::SystemTimeError> for Error {
    fn from(_e: std::time::SystemTimeError) -> Self {
        Error::new(ErrorCode::SysTimeFail)
    }
}

impl From<ccm::aead::Error> for Error {
    fn from(_e: ccm::aead::Error) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_e: TryFromSliceError) -> Self {
        Self::new(ErrorCode::Invalid)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(not(all(feature = "std", feature = "backtrace")))]
        {
            write!(f, "Error::{}", self)?;
        }

        #[cfg(all(feature = "std", feature = "backtrace"))]
        {
            writeln!(f, "Error::{} {{", self)?;
            write!(f, "{}", self.backtrace())?;
            writeln!(f, "}}")?;
        }

        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(all(feature = "std", feature = "backtrace"))]
        {
            write!(
                f,
                "{:?}: {}",
                self.code(),
                self.inner
                    .as_ref()
                    .map_or(String::new(), |err| { err.to_string() })
            )
        }
        #[cfg(not(all(feature = "std", feature = "backtrace")))]
        {
            write!(f, "{:?}", self.code())
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_only_matching() {
        let e: Error = ErrorCode::TLVNotFound.into();
        assert_eq!(
            e.map_invalid(ErrorCode::HandshakeFailed.into()).code(),
            ErrorCode::HandshakeFailed
        );

        let e: Error = ErrorCode::Busy.into();
        assert_eq!(
            e.map_invalid(ErrorCode::HandshakeFailed.into()).code(),
            ErrorCode::Busy
        );
    }

    #[test]
    fn auth_failures() {
        assert!(Error::new(ErrorCode::AuthenticationFailed).is_auth_failure());
        assert!(Error::new(ErrorCode::InvalidSignature).is_auth_failure());
        assert!(!Error::new(ErrorCode::StaleCounter).is_auth_failure());
    }
}
