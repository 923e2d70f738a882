// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::fmt;
use std::io;
use std::error;
use std::result;
use serde::{ser, de};

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// Unsupported opcode
    Unsupported(u8),
    /// EOF while parsing op argument
    EOFWhileParsing,
    /// Stack underflowed
    StackUnderflow,
    /// No MARK found for a group-closing opcode
    MarkNotFound,
    /// Length prefix found negative
    NegativeLength,
    /// String decoding as UTF-8 failed
    StringNotUTF8,
    /// Wrong stack top type for opcode
    InvalidStackTop(&'static str, String),
    /// Value not hashable, but used as dict key
    ValueNotHashable,
    /// Recursive structure found where it can't be represented
    Recursive,
    /// A "module global" could not be resolved
    UnresolvedGlobal(String, String),
    /// A global was invoked that has no callable behind it
    NotCallable(String),
    /// A value was missing from the memo
    MissingMemo(u32),
    /// Invalid literal found
    InvalidLiteral(Vec<u8>),
    /// Quoted string literal is malformed
    InsecureString,
    /// Protocol number outside of the supported range
    UnsupportedProtocol(u8),
    /// EXT opcode with a code nobody registered
    UnregisteredExtension(u32),
    /// Persistent id found, but no persistent_load hook given
    NoPersistentLoad,
    /// Persistent id can't be written in the selected protocol
    InvalidPersistentId(String),
    /// Object has no reduce hook at all
    Unpicklable(String),
    /// Reduce hook returned something of the wrong shape
    InvalidReduce(String),
    /// Module or global name can't be written as a line
    InvalidGlobalName(String),
    /// Memo table can't grow further
    MemoFull,
    /// Found trailing bytes after STOP opcode
    TrailingBytes,
    /// The deserializer already failed on this stream
    StreamFailed,
    /// Values nested deeper than the configured limit
    NestingTooDeep(usize),
    /// Invalid value in pickle stream
    InvalidValue(String),
    /// Structure (de)serialization error
    Structure(String),
}

/// Classification of errors, following the usual pickle exception
/// hierarchy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// The value graph could not be turned into a pickle.
    Pickling,
    /// The stream could not be interpreted.
    Unpickling,
    /// A `GET` named a memo position that was never `PUT`.
    BadMemoReference,
    /// Input ended in the middle of an opcode.
    EndOfStream,
    /// Malformed literal or out-of-range protocol number.
    Value,
    /// The underlying reader or writer failed.
    Io,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            ErrorCode::EOFWhileParsing => ErrorKind::EndOfStream,
            ErrorCode::MissingMemo(_) => ErrorKind::BadMemoReference,
            ErrorCode::InvalidLiteral(_) |
            ErrorCode::InsecureString |
            ErrorCode::UnsupportedProtocol(_) |
            ErrorCode::UnregisteredExtension(_) => ErrorKind::Value,
            ErrorCode::Unpicklable(_) |
            ErrorCode::InvalidReduce(_) |
            ErrorCode::InvalidPersistentId(_) |
            ErrorCode::InvalidGlobalName(_) |
            ErrorCode::MemoFull => ErrorKind::Pickling,
            _ => ErrorKind::Unpickling,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ErrorCode::Unsupported(op) => write!(fmt, "invalid load key, {:?}", op as char),
            ErrorCode::EOFWhileParsing => write!(fmt, "EOF while parsing"),
            ErrorCode::StackUnderflow => write!(fmt, "pickle stack underflow"),
            ErrorCode::MarkNotFound => write!(fmt, "input stream corrupt, mark not found"),
            ErrorCode::NegativeLength => write!(fmt, "negative length prefix"),
            ErrorCode::StringNotUTF8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::InvalidStackTop(what, ref it) =>
                write!(fmt, "invalid stack top, expected {}, got {}", what, it),
            ErrorCode::ValueNotHashable => write!(fmt, "dict key not hashable"),
            ErrorCode::Recursive => write!(fmt, "recursive structure found"),
            ErrorCode::UnresolvedGlobal(ref m, ref g) =>
                write!(fmt, "unresolved global: {}.{}", m, g),
            ErrorCode::NotCallable(ref g) => write!(fmt, "global {} is not callable", g),
            ErrorCode::MissingMemo(n) => write!(fmt, "missing memo with id {}", n),
            ErrorCode::InvalidLiteral(ref l) =>
                write!(fmt, "literal is invalid: {}", String::from_utf8_lossy(l)),
            ErrorCode::InsecureString => write!(fmt, "insecure string pickle"),
            ErrorCode::UnsupportedProtocol(p) =>
                write!(fmt, "unsupported pickle protocol: {}", p),
            ErrorCode::UnregisteredExtension(c) =>
                write!(fmt, "unregistered extension code {}", c),
            ErrorCode::NoPersistentLoad =>
                write!(fmt, "persistent id found, but no persistent_load hook specified"),
            ErrorCode::InvalidPersistentId(ref s) => write!(fmt, "invalid persistent id: {}", s),
            ErrorCode::Unpicklable(ref s) => write!(fmt, "cannot pickle {} objects", s),
            ErrorCode::InvalidReduce(ref s) => write!(fmt, "invalid reduce value: {}", s),
            ErrorCode::InvalidGlobalName(ref s) => write!(fmt, "invalid global name: {:?}", s),
            ErrorCode::MemoFull => write!(fmt, "memo table is full"),
            ErrorCode::TrailingBytes => write!(fmt, "trailing bytes found"),
            ErrorCode::StreamFailed => write!(fmt, "stream already failed to unpickle"),
            ErrorCode::NestingTooDeep(limit) =>
                write!(fmt, "values nested deeper than {} levels", limit),
            ErrorCode::InvalidValue(ref s) => write!(fmt, "invalid value: {}", s),
            ErrorCode::Structure(ref s) => fmt.write_str(s),
        }
    }
}

/// This type represents all possible errors that can occur when serializing or
/// deserializing a value.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred when serializing or deserializing a value.
    Io(io::Error),
    /// The value graph could not be pickled.
    Pickling(ErrorCode),
    /// The pickle had some error while interpreting, at the given offset.
    Eval(ErrorCode, usize),
    /// Error while converting between values and other data models.
    Syntax(ErrorCode),
}

impl Error {
    /// The error code, if this isn't an IO error.
    pub fn code(&self) -> Option<&ErrorCode> {
        match *self {
            Error::Io(_) => None,
            Error::Pickling(ref code) |
            Error::Eval(ref code, _) |
            Error::Syntax(ref code) => Some(code),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::Io(ref err) if err.kind() == io::ErrorKind::UnexpectedEof =>
                ErrorKind::EndOfStream,
            Error::Io(_) => ErrorKind::Io,
            Error::Pickling(ref code) => match code.kind() {
                ErrorKind::Unpickling => ErrorKind::Pickling,
                kind => kind,
            },
            Error::Eval(ref code, _) |
            Error::Syntax(ref code) => code.kind(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref error) => error.fmt(fmt),
            Error::Pickling(ref code) => write!(fmt, "pickling error: {}", code),
            Error::Eval(ref code, offset) => write!(fmt, "eval error at offset {}: {}",
                                                    offset, code),
            Error::Syntax(ref code) => write!(fmt, "decoding error: {}", code)
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}

impl ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}
