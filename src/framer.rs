//! Incremental splitting of the byte stream into protocol records.
use crate::AGIParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// Bare newline, as used by FastAGI.
    Lf,
    /// Carriage-return-newline, as used by AMI. Bare newlines are tolerated.
    CrLf,
}

/// Buffers bytes read from the network and yields complete records.
///
/// Records are yielded without their terminator. Empty records are significant
/// and are delivered: they end the FastAGI environment block and terminate an
/// AMI message.
#[derive(Debug)]
pub(crate) struct LineFramer {
    terminator: Terminator,
    buf: Vec<u8>,
}
impl LineFramer {
    /// A framer for FastAGI streams.
    pub(crate) fn lf() -> Self {
        LineFramer {
            terminator: Terminator::Lf,
            buf: Vec::new(),
        }
    }

    /// A framer for AMI streams.
    pub(crate) fn crlf() -> Self {
        LineFramer {
            terminator: Terminator::CrLf,
            buf: Vec::new(),
        }
    }

    /// Append the bytes of one read and strip off as many complete records as
    /// they contain. A record split over multiple reads is yielded once its
    /// terminator has arrived.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, AGIParseError> {
        self.buf.extend_from_slice(bytes);
        let mut records = Vec::new();
        while let Some(newline_index) = self.buf.iter().position(|b| *b == b'\n') {
            let mut record: Vec<u8> = self.buf.drain(..=newline_index).collect();
            record.pop();
            if self.terminator == Terminator::CrLf && record.last() == Some(&b'\r') {
                record.pop();
            }
            records.push(String::from_utf8(record).map_err(|_| AGIParseError::NotUtf8)?);
        }
        Ok(records)
    }
}
