use core::fmt;

/// Everything that can go wrong while decoding captured PDUs or serving host commands.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A length field disagrees with the data that follows it.
    InvalidLength,

    /// A field holds a value that is not allowed, such as a zero hop increment or a command
    /// argument the sniffer cannot act on.
    InvalidValue,

    /// Ran out of buffer while reading or writing.
    Eof,

    /// Bytes were left over after decoding.
    IncompleteParse,

    /// A channel index or frequency outside of the BLE band was supplied.
    OutOfRange,

    /// The capture context has not yet picked up the previous schedule change.
    Busy,

    /// The command is recognized but not supported by this implementation.
    Unsupported,

    /// A host transfer stalled and was not completed after retrying.
    Stalled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "length field mismatch",
            Error::InvalidValue => "invalid field value",
            Error::Eof => "buffer exhausted",
            Error::IncompleteParse => "trailing bytes after PDU",
            Error::OutOfRange => "channel out of range",
            Error::Busy => "schedule change already pending",
            Error::Unsupported => "unsupported command",
            Error::Stalled => "transfer stalled",
        })
    }
}
