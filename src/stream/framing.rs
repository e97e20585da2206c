//! XMPP XML framing: top-level element extraction from a TCP byte stream
//! and stream header construction.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::error;

use crate::error::StreamError;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// One unit cut from the incoming byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` opening tag (with any XML declaration before it).
    StreamOpen(String),
    /// `</stream:stream>`.
    StreamClose,
    /// A complete top-level element such as `<stream:features>` or `<success/>`.
    Element(String),
}

/// The opening of a client-to-server stream.
pub fn stream_header(to: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='{}' xmlns:stream='{}'>",
        quick_xml::escape::escape(to),
        NS_CLIENT,
        NS_STREAMS
    )
}

/// State machine for top-level element boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between elements, or before the stream header.
    Idle,
    /// Inside a top-level element, collecting events.
    InElement,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(name: quick_xml::name::QName<'_>) -> bool {
    name.local_name().as_ref() == b"stream" || name.as_ref() == b"stream:stream"
}

/// Extract a single complete frame from the start of `buffer`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` when a frame is complete,
/// `Ok(None)` when more data is needed, and an error for XML that can never
/// become well-formed. The caller advances past the consumed bytes.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, StreamError> {
    FrameScanner::default().scan(buffer)
}

/// Incremental form of [`extract_frame`] for a growing buffer.
///
/// Between calls the scanner remembers how far it got, so bytes already
/// parsed are not parsed again when more data arrives. The buffer may only
/// grow at the end until a frame is returned; the caller then drains the
/// consumed bytes and the scanner starts over at the new front.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    /// End of the last complete event, relative to the buffer start.
    offset: usize,
    depth: u32,
    state: ParserState,
    element_start: usize,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self {
            offset: 0,
            depth: 0,
            state: ParserState::Idle,
            element_start: 0,
        }
    }
}

impl FrameScanner {
    /// Forget any progress, e.g. after the buffer was cleared.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn scan(&mut self, buffer: &[u8]) -> Result<Option<(Frame, usize)>, StreamError> {
        let first = buffer
            .iter()
            .position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'));
        let Some(start) = first else {
            return Ok(None);
        };
        // The closing tag arrives alone, without its opening tag in the buffer.
        if self.offset == 0 && buffer[start..].starts_with(STREAM_CLOSE) {
            return Ok(Some((Frame::StreamClose, start + STREAM_CLOSE.len())));
        }

        let result = self.resume(buffer, start);
        if !matches!(result, Ok(None)) {
            self.reset();
        }
        result
    }

    fn resume(&mut self, buffer: &[u8], start: usize) -> Result<Option<(Frame, usize)>, StreamError> {
        let base = self.offset;
        let mut reader = Reader::from_reader(&buffer[base..]);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        loop {
            let pos = base + reader.buffer_position() as usize;

            let event = reader.read_event();
            let tag_end = base + reader.buffer_position() as usize;
            match event {
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
                Ok(Event::Start(e)) => {
                    if self.state == ParserState::Idle && is_stream_tag(e.name()) {
                        let text = bytes_to_string(&buffer[start..tag_end]);
                        return Ok(Some((Frame::StreamOpen(text), tag_end)));
                    }

                    self.depth += 1;
                    if self.state == ParserState::Idle && self.depth == 1 {
                        self.state = ParserState::InElement;
                        self.element_start = pos;
                    }
                }
                Ok(Event::Empty(e)) => {
                    if self.state == ParserState::Idle && is_stream_tag(e.name()) {
                        // `<stream:stream/>` opens and closes at once; treat as a close.
                        return Ok(Some((Frame::StreamClose, tag_end)));
                    }
                    if self.state == ParserState::Idle && self.depth == 0 {
                        let text = bytes_to_string(&buffer[pos..tag_end]);
                        return Ok(Some((Frame::Element(text.trim_start().to_string()), tag_end)));
                    }
                }
                Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
                Ok(Event::End(e)) => {
                    if is_stream_tag(e.name()) && self.depth == 0 {
                        return Ok(Some((Frame::StreamClose, tag_end)));
                    }

                    self.depth = self.depth.saturating_sub(1);
                    if self.state == ParserState::InElement && self.depth == 0 {
                        let text = bytes_to_string(&buffer[self.element_start..tag_end]);
                        return Ok(Some((Frame::Element(text.trim_start().to_string()), tag_end)));
                    }
                }
                Ok(Event::Eof) => return Ok(None),
                Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                    // A partial element; the next read completes it.
                    return Ok(None);
                }
                Err(quick_xml::Error::Syntax(
                    SyntaxError::UnclosedComment
                    | SyntaxError::UnclosedCData
                    | SyntaxError::UnclosedDoctype
                    | SyntaxError::UnclosedPIOrXmlDecl,
                )) => return Ok(None),
                Err(e) => {
                    error!(error = ?e, "XML parsing error");
                    return Err(StreamError::Xml(e.to_string()));
                }
            }
            self.offset = tag_end;
        }
    }
}
