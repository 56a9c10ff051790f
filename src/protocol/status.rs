//! Server-defined status codes.
//!
//! Every reply may carry a numeric `code`; zero (or absent) means success.
//! Codes this client does not know are folded into
//! [`StatusCode::UnknownError`] and treated as a generic failure.

use serde::{Deserialize, Serialize};

/// Status code reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum StatusCode {
    #[default]
    Ok,
    Invalid,
    KeyError,
    TypeError,
    IoError,
    EndOfFile,
    NotImplemented,
    AssertionFailed,
    UserInputError,

    ObjectExists,
    ObjectNotExists,
    ObjectSealed,
    ObjectNotSealed,
    ObjectIsBlob,
    ObjectTypeError,
    ObjectSpilled,
    ObjectNotSpilled,

    MetaTreeInvalid,
    MetaTreeTypeInvalid,
    MetaTreeTypeNotExists,
    MetaTreeNameInvalid,
    MetaTreeNameNotExists,
    MetaTreeLinkInvalid,
    MetaTreeSubtreeNotExists,

    ServerNotReady,
    ArrowError,
    ConnectionFailed,
    ConnectionError,
    EtcdError,
    AlreadyStopped,
    RedisError,

    NotEnoughMemory,
    StreamDrained,
    StreamFailed,
    InvalidStreamState,
    StreamOpened,

    GlobalObjectInvalid,

    UnknownError,
}

impl StatusCode {
    /// Numeric wire value.
    pub fn code(self) -> i64 {
        use StatusCode::*;
        match self {
            Ok => 0,
            Invalid => 1,
            KeyError => 2,
            TypeError => 3,
            IoError => 4,
            EndOfFile => 5,
            NotImplemented => 6,
            AssertionFailed => 7,
            UserInputError => 8,
            ObjectExists => 11,
            ObjectNotExists => 12,
            ObjectSealed => 13,
            ObjectNotSealed => 14,
            ObjectIsBlob => 15,
            ObjectTypeError => 16,
            ObjectSpilled => 17,
            ObjectNotSpilled => 18,
            MetaTreeInvalid => 21,
            MetaTreeTypeInvalid => 22,
            MetaTreeTypeNotExists => 23,
            MetaTreeNameInvalid => 24,
            MetaTreeNameNotExists => 25,
            MetaTreeLinkInvalid => 26,
            MetaTreeSubtreeNotExists => 27,
            ServerNotReady => 31,
            ArrowError => 32,
            ConnectionFailed => 33,
            ConnectionError => 34,
            EtcdError => 35,
            AlreadyStopped => 36,
            RedisError => 37,
            NotEnoughMemory => 41,
            StreamDrained => 42,
            StreamFailed => 43,
            InvalidStreamState => 44,
            StreamOpened => 45,
            GlobalObjectInvalid => 51,
            UnknownError => 255,
        }
    }

    /// Map a wire value to a status code; unknown values become `UnknownError`.
    pub fn from_code(code: i64) -> Self {
        use StatusCode::*;
        match code {
            0 => Ok,
            1 => Invalid,
            2 => KeyError,
            3 => TypeError,
            4 => IoError,
            5 => EndOfFile,
            6 => NotImplemented,
            7 => AssertionFailed,
            8 => UserInputError,
            11 => ObjectExists,
            12 => ObjectNotExists,
            13 => ObjectSealed,
            14 => ObjectNotSealed,
            15 => ObjectIsBlob,
            16 => ObjectTypeError,
            17 => ObjectSpilled,
            18 => ObjectNotSpilled,
            21 => MetaTreeInvalid,
            22 => MetaTreeTypeInvalid,
            23 => MetaTreeTypeNotExists,
            24 => MetaTreeNameInvalid,
            25 => MetaTreeNameNotExists,
            26 => MetaTreeLinkInvalid,
            27 => MetaTreeSubtreeNotExists,
            31 => ServerNotReady,
            32 => ArrowError,
            33 => ConnectionFailed,
            34 => ConnectionError,
            35 => EtcdError,
            36 => AlreadyStopped,
            37 => RedisError,
            41 => NotEnoughMemory,
            42 => StreamDrained,
            43 => StreamFailed,
            44 => InvalidStreamState,
            45 => StreamOpened,
            51 => GlobalObjectInvalid,
            _ => UnknownError,
        }
    }

    /// Whether this is the success code.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl From<i64> for StatusCode {
    fn from(code: i64) -> Self {
        StatusCode::from_code(code)
    }
}

impl From<StatusCode> for i64 {
    fn from(code: StatusCode) -> Self {
        code.code()
    }
}
