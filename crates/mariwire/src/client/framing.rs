//! Response framing.
//!
//! A [`Framer`] watches the frames of one command's response and reports
//! when the last one has arrived. The pipelined dispatcher relies on it to
//! know when to hand the stream to the next queued command; the frames
//! themselves are passed on unmodified.

use mariwire_core::Error;
use mariwire_core::error::ProtocolError;

use crate::protocol::reader::PacketReader;
use crate::protocol::server_status::SERVER_MORE_RESULTS_EXISTS;
use crate::protocol::{MAX_PACKET_SIZE, parse_stmt_prepare_ok};

/// Shape of the response a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Single OK or ERR frame (ping, reset)
    Simple,
    /// OK, ERR, or one or more result sets (query, execute)
    ResultSet,
    /// COM_STMT_PREPARE reply followed by parameter and column definitions
    Prepare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the first frame of a (possibly follow-up) result
    Head,
    /// Column definitions still expected
    Columns(u64),
    /// EOF frame closing the column definitions
    ColumnsEof,
    /// Rows until a terminator frame
    Rows,
    /// Definition frames left after a prepare OK
    Definitions(u64),
    Complete,
}

/// What a frame meant for the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    More,
    Complete,
}

/// Tracks framing of one response.
#[derive(Debug, Clone)]
pub struct Framer {
    kind: ResponseKind,
    deprecate_eof: bool,
    stage: Stage,
    status_flags: Option<u16>,
    error: bool,
}

impl Framer {
    pub fn new(kind: ResponseKind, deprecate_eof: bool) -> Self {
        Self {
            kind,
            deprecate_eof,
            stage: Stage::Head,
            status_flags: None,
            error: false,
        }
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    /// Status flags from the last terminal frame seen.
    pub fn status_flags(&self) -> Option<u16> {
        self.status_flags
    }

    /// Did the response end with an ERR frame?
    pub fn ended_in_error(&self) -> bool {
        self.error
    }

    /// Account for one frame.
    ///
    /// An error means the stream no longer matches the expected framing;
    /// the connection cannot be used after that.
    pub fn feed(&mut self, frame: &[u8]) -> Result<Progress, Error> {
        let first = *frame
            .first()
            .ok_or_else(|| framing_error("empty frame", frame))?;

        let stage = self.stage;
        self.stage = match stage {
            Stage::Head => self.head(first, frame)?,
            Stage::Columns(remaining) => {
                if first == 0xFF {
                    self.error = true;
                    Stage::Complete
                } else if remaining > 1 {
                    Stage::Columns(remaining - 1)
                } else if self.deprecate_eof {
                    Stage::Rows
                } else {
                    Stage::ColumnsEof
                }
            }
            Stage::ColumnsEof => {
                if first != 0xFE {
                    return Err(framing_error("expected EOF after column definitions", frame));
                }
                Stage::Rows
            }
            Stage::Rows => self.row(first, frame)?,
            Stage::Definitions(remaining) => {
                if remaining > 1 {
                    Stage::Definitions(remaining - 1)
                } else {
                    Stage::Complete
                }
            }
            Stage::Complete => {
                return Err(framing_error("frame after end of response", frame));
            }
        };

        Ok(if self.stage == Stage::Complete {
            Progress::Complete
        } else {
            Progress::More
        })
    }

    fn head(&mut self, first: u8, frame: &[u8]) -> Result<Stage, Error> {
        if first == 0xFF {
            self.error = true;
            return Ok(Stage::Complete);
        }

        match self.kind {
            ResponseKind::Simple => {
                if first != 0x00 {
                    return Err(framing_error("expected OK or ERR", frame));
                }
                self.record_ok(frame)?;
                Ok(Stage::Complete)
            }
            ResponseKind::Prepare => {
                let ok = parse_stmt_prepare_ok(frame)?;
                let eof = |n: u16| u64::from(n > 0 && !self.deprecate_eof);
                let defs = u64::from(ok.num_params)
                    + eof(ok.num_params)
                    + u64::from(ok.num_columns)
                    + eof(ok.num_columns);
                Ok(if defs == 0 {
                    Stage::Complete
                } else {
                    Stage::Definitions(defs)
                })
            }
            ResponseKind::ResultSet => match first {
                0x00 => {
                    let status = self.record_ok(frame)?;
                    Ok(self.after_result(status))
                }
                0xFB => Err(framing_error("LOCAL INFILE requests are not supported", frame)),
                _ => {
                    let count = PacketReader::new(frame)
                        .read_lenenc_int()
                        .filter(|&n| n > 0)
                        .ok_or_else(|| framing_error("invalid column count", frame))?;
                    Ok(Stage::Columns(count))
                }
            },
        }
    }

    fn row(&mut self, first: u8, frame: &[u8]) -> Result<Stage, Error> {
        match first {
            0xFF => {
                self.error = true;
                Ok(Stage::Complete)
            }
            0xFE if frame.len() < 9 && !self.deprecate_eof => {
                let eof = PacketReader::new(frame)
                    .parse_eof_packet()
                    .ok_or_else(|| framing_error("truncated EOF frame", frame))?;
                self.status_flags = Some(eof.status_flags);
                Ok(self.after_result(eof.status_flags))
            }
            0xFE if frame.len() < MAX_PACKET_SIZE && self.deprecate_eof => {
                let status = self.record_ok(frame)?;
                Ok(self.after_result(status))
            }
            _ => Ok(Stage::Rows),
        }
    }

    fn record_ok(&mut self, frame: &[u8]) -> Result<u16, Error> {
        let ok = PacketReader::new(frame)
            .parse_ok_packet()
            .ok_or_else(|| framing_error("truncated OK frame", frame))?;
        self.status_flags = Some(ok.status_flags);
        Ok(ok.status_flags)
    }

    fn after_result(&self, status_flags: u16) -> Stage {
        if status_flags & SERVER_MORE_RESULTS_EXISTS != 0 {
            Stage::Head
        } else {
            Stage::Complete
        }
    }
}

fn framing_error(message: &str, frame: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("response framing: {message}"),
        raw_data: Some(frame.to_vec()),
        source: None,
    })
}
