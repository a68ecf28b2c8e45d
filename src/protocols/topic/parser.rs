//! Topic record parser.

/// Topic whose value is stored on the connection.
pub const EMAIL_TOPIC: &[u8] = b"email";

/// A parsed `topic:value` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
    /// `email:<address>`. Value ends at the first CR.
    Email(&'a [u8]),
    /// Any other topic. Parsed but carries no behavior.
    Other { topic: &'a [u8], value: &'a [u8] },
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// Complete record with bytes consumed (line + CRLF).
    Complete(Record<'a>, usize),
    /// Complete line without a colon. Bytes consumed.
    NoTopic(usize),
    /// No CRLF yet, need more data.
    Incomplete,
}

/// Parse one record from the front of `input`.
///
/// `scan_from` is where the CRLF search starts. Bytes before it are known not
/// to contain a terminator, so a caller that keeps appending to the same
/// buffer does not rescan them.
pub fn parse(input: &[u8], scan_from: usize) -> ParseResult<'_> {
    let line_end = match find_crlf(input, scan_from) {
        Some(pos) => pos,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    let consumed = line_end + 2; // include \r\n

    let colon = match line.iter().position(|&b| b == b':') {
        Some(pos) => pos,
        None => return ParseResult::NoTopic(consumed),
    };

    let topic = &line[..colon];
    let value = &line[colon + 1..];

    // Case-sensitive match
    if topic == EMAIL_TOPIC {
        let end = value.iter().position(|&b| b == b'\r').unwrap_or(value.len());
        ParseResult::Complete(Record::Email(&value[..end]), consumed)
    } else {
        ParseResult::Complete(Record::Other { topic, value }, consumed)
    }
}

/// Find \r\n in buffer at or after `from`, returning the position of \r.
pub fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    (from..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}
