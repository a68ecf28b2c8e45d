//! Per-client connection state and the registry that owns it.
//!
//! Each connection accumulates inbound bytes in a bounded buffer and hands
//! complete lines to the topic parser. Connections are generic over the
//! stream so the buffering logic can be driven without real sockets.

#![allow(dead_code)] // Registry accessors beyond the event loop's needs are used by tests

use crate::error::{ConnectionError, RegistryError};
use crate::protocols::topic::parser::{self, ParseResult, Record};
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Size limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum bytes buffered without a complete line.
    pub max_request_size: usize,
    /// Maximum accepted length of an email value.
    pub max_email_len: usize,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Client stream. Closed when the connection is dropped.
    pub stream: S,
    /// Remote address, fixed at accept time.
    pub peer: SocketAddr,
    /// Bytes received but not yet consumed as complete lines.
    buffer: BytesMut,
    /// Offset up to which `buffer` is known to hold no CRLF.
    scanned: usize,
    email: Option<String>,
    limits: Limits,
}

impl<S> Connection<S> {
    /// Create a new connection with an empty buffer.
    pub fn new(stream: S, peer: SocketAddr, limits: Limits) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(limits.max_request_size),
            scanned: 0,
            email: None,
            limits,
        }
    }

    /// Number of buffered bytes not yet consumed by the parser.
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Last email recorded on this connection.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Append `data` and consume every complete line.
    ///
    /// Returns the number of lines consumed. Fails with
    /// `ConnectionError::Overflow` if the data does not fit, or if the buffer
    /// is left full with no terminator.
    pub fn ingest(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        if data.len() > self.limits.max_request_size - self.buffer.len() {
            return Err(ConnectionError::Overflow(self.limits.max_request_size));
        }
        self.buffer.extend_from_slice(data);
        self.after_append()
    }

    fn after_append(&mut self) -> Result<usize, ConnectionError> {
        let lines = self.process_buffer();
        if self.buffer.len() >= self.limits.max_request_size {
            return Err(ConnectionError::Overflow(self.limits.max_request_size));
        }
        Ok(lines)
    }

    /// Consume complete lines from the front of the buffer.
    fn process_buffer(&mut self) -> usize {
        let mut lines = 0;

        loop {
            let consumed = match parser::parse(&self.buffer, self.scanned) {
                ParseResult::Incomplete => break,
                ParseResult::NoTopic(consumed) => {
                    debug!(peer = %self.peer, "Line without topic ignored");
                    consumed
                }
                ParseResult::Complete(record, consumed) => {
                    if let Some(email) = accept_email(&record, self.limits.max_email_len, self.peer) {
                        self.email = Some(email);
                    }
                    consumed
                }
            };

            self.buffer.advance(consumed);
            self.scanned = 0;
            lines += 1;
        }

        // A CR at the very end may still be followed by LF
        self.scanned = self.buffer.len().saturating_sub(1);
        lines
    }
}

impl<S: Read> Connection<S> {
    /// Read until the stream would block, parsing after every read.
    ///
    /// Returns total bytes read. A zero-length read is reported as
    /// `ConnectionError::Closed`.
    pub fn read_available(&mut self) -> Result<usize, ConnectionError> {
        let capacity = self.limits.max_request_size;
        let mut total = 0;

        loop {
            // Buffer is never full here: a full buffer is reported as overflow
            let start = self.buffer.len();
            self.buffer.resize(capacity, 0);

            let result = self.stream.read(&mut self.buffer[start..]);
            match result {
                Ok(0) => {
                    self.buffer.truncate(start);
                    return Err(ConnectionError::Closed);
                }
                Ok(n) => {
                    self.buffer.truncate(start + n);
                    total += n;
                    self.after_append()?;
                }
                Err(e) => {
                    self.buffer.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(total),
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(e.into()),
                    }
                }
            }
        }
    }
}

/// Decide whether a parsed record updates the stored email.
fn accept_email(record: &Record<'_>, max_len: usize, peer: SocketAddr) -> Option<String> {
    match record {
        Record::Email(value) => {
            debug!(peer = %peer, topic = "email", "Parsed record");
            if value.len() >= max_len {
                warn!(peer = %peer, len = value.len(), max_len, "Email value too long, ignored");
                return None;
            }
            let email = String::from_utf8_lossy(value).into_owned();
            info!(peer = %peer, email = %email, "Email registered");
            Some(email)
        }
        Record::Other { topic, value } => {
            debug!(
                peer = %peer,
                topic = %String::from_utf8_lossy(topic),
                len = value.len(),
                "Parsed record"
            );
            None
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The slab key doubles
/// as the connection id and the poll token. Unbounded unless a cap is given.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: Option<usize>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry, optionally capped at `max_connections`.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            connections: Slab::new(),
            max_connections,
        }
    }

    /// Look up a connection, or create one when `id` is `None`.
    ///
    /// `None` stands for a socket that has just been accepted and has no id
    /// yet; `create` is only called in that case.
    pub fn get_or_create<F>(
        &mut self,
        id: Option<usize>,
        create: F,
    ) -> Result<(usize, &mut Connection<S>), RegistryError>
    where
        F: FnOnce() -> Connection<S>,
    {
        match id {
            Some(id) => self
                .connections
                .get_mut(id)
                .map(|conn| (id, conn))
                .ok_or(RegistryError::NotFound(id)),
            None => {
                if let Some(max) = self.max_connections {
                    if self.connections.len() >= max {
                        return Err(RegistryError::Full(max));
                    }
                }
                let id = self.connections.insert(create());
                Ok((id, &mut self.connections[id]))
            }
        }
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    ///
    /// The stream closes when the returned connection is dropped. Removing an
    /// unknown id is an invariant violation.
    pub fn remove(&mut self, id: usize) -> Result<Connection<S>, RegistryError> {
        self.connections.try_remove(id).ok_or(RegistryError::NotFound(id))
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed, if capped.
    pub fn capacity(&self) -> Option<usize> {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const LIMITS: Limits = Limits {
        max_request_size: 64,
        max_email_len: 32,
    };

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Stream that hands out scripted reads, then would block.
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedStream {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
            }
        }

        fn push(&mut self, data: &[u8]) {
            self.reads.push_back(Ok(data.to_vec()));
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    fn conn() -> Connection<()> {
        Connection::new((), peer(), LIMITS)
    }

    #[test]
    fn test_single_email_record() {
        let mut c = conn();
        assert_eq!(c.ingest(b"email:a@b.com\r\n").unwrap(), 1);
        assert_eq!(c.email(), Some("a@b.com"));
        assert_eq!(c.received(), 0);
    }

    #[test]
    fn test_split_across_reads() {
        let mut whole = conn();
        whole.ingest(b"email:bob@x.com\r\n").unwrap();

        let mut split = conn();
        split.ingest(b"em").unwrap();
        assert_eq!(split.email(), None);
        assert_eq!(split.received(), 2);
        split.ingest(b"ail:bob@x.com\r\n").unwrap();

        assert_eq!(split.email(), whole.email());
    }

    /// Feed `chunks` through `read_available`, one read wake-up per chunk.
    fn read_chunks(chunks: &[&[u8]]) -> Connection<ScriptedStream> {
        let mut c = Connection::new(ScriptedStream::new(Vec::new()), peer(), LIMITS);
        for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
            c.stream.push(chunk);
            c.read_available().unwrap();
        }
        c
    }

    #[test]
    fn test_every_split_point_gives_same_email() {
        let record: &[u8] = b"email:bob@x.com\r\n";
        for cut in 0..=record.len() {
            let c = read_chunks(&[&record[..cut], &record[cut..]]);
            assert_eq!(c.email(), Some("bob@x.com"), "cut at {cut}");
            assert_eq!(c.received(), 0);
        }
    }

    #[test]
    fn test_every_pair_of_split_points_gives_same_email() {
        let record: &[u8] = b"email:a@b.com\r\nemail:c@d.com\r\n";
        for first in 0..=record.len() {
            for second in first..=record.len() {
                let c = read_chunks(&[&record[..first], &record[first..second], &record[second..]]);
                assert_eq!(c.email(), Some("c@d.com"), "cuts at {first}, {second}");
                assert_eq!(c.received(), 0);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let record: &[u8] = b"email:slow@x.com\r\n";
        let chunks: Vec<&[u8]> = record.chunks(1).collect();
        let c = read_chunks(&chunks);
        assert_eq!(c.email(), Some("slow@x.com"));
    }

    #[test]
    fn test_last_email_wins() {
        let c = read_chunks(&[&b"email:a@b.com\r\nemail:c@d.com\r\n"[..]]);
        assert_eq!(c.email(), Some("c@d.com"));

        let mut c = conn();
        assert_eq!(c.ingest(b"email:a@b.com\r\nemail:c@d.com\r\n").unwrap(), 2);
        assert_eq!(c.email(), Some("c@d.com"));
    }

    #[test]
    fn test_other_topic_leaves_email() {
        let mut c = conn();
        c.ingest(b"email:a@b.com\r\n").unwrap();
        c.ingest(b"foo:bar\r\n").unwrap();
        c.ingest(b"no colon here\r\n").unwrap();
        assert_eq!(c.email(), Some("a@b.com"));
    }

    #[test]
    fn test_partial_tail_is_kept() {
        let mut c = conn();
        c.ingest(b"email:a@b.com\r\nemail:c@").unwrap();
        assert_eq!(c.email(), Some("a@b.com"));
        assert_eq!(c.received(), 8);
        c.ingest(b"d.com\r\n").unwrap();
        assert_eq!(c.email(), Some("c@d.com"));
    }

    #[test]
    fn test_overlong_email_ignored() {
        let mut c = conn();
        c.ingest(b"email:a@b.com\r\n").unwrap();
        let long = format!("email:{}\r\n", "x".repeat(LIMITS.max_email_len));
        c.ingest(long.as_bytes()).unwrap();
        assert_eq!(c.email(), Some("a@b.com"));
    }

    #[test]
    fn test_overflow_without_terminator() {
        let mut c = conn();
        let filler = vec![b'x'; LIMITS.max_request_size - 1];
        c.ingest(&filler).unwrap();
        assert!(matches!(
            c.ingest(b"x"),
            Err(ConnectionError::Overflow(64))
        ));
    }

    #[test]
    fn test_ingest_rejects_data_that_cannot_fit() {
        let mut c = conn();
        let too_big = vec![b'x'; LIMITS.max_request_size + 1];
        assert!(matches!(c.ingest(&too_big), Err(ConnectionError::Overflow(_))));
        assert_eq!(c.received(), 0);
    }

    #[test]
    fn test_read_available_until_would_block() {
        let stream = ScriptedStream::new(vec![Ok(b"em".to_vec()), Ok(b"ail:a@b.com\r\n".to_vec())]);
        let mut c = Connection::new(stream, peer(), LIMITS);

        assert_eq!(c.read_available().unwrap(), 15);
        assert_eq!(c.email(), Some("a@b.com"));

        // Nothing more to read
        assert_eq!(c.read_available().unwrap(), 0);

        c.stream.push(b"email:c@d.com\r\n");
        c.read_available().unwrap();
        assert_eq!(c.email(), Some("c@d.com"));
    }

    #[test]
    fn test_read_available_split_terminator() {
        let stream = ScriptedStream::new(vec![Ok(b"email:x@y.z\r".to_vec())]);
        let mut c = Connection::new(stream, peer(), LIMITS);
        c.read_available().unwrap();
        assert_eq!(c.email(), None);

        c.stream.push(b"\n");
        c.read_available().unwrap();
        assert_eq!(c.email(), Some("x@y.z"));
    }

    #[test]
    fn test_read_available_reports_close() {
        let stream = ScriptedStream::new(vec![Ok(b"email:a".to_vec()), Ok(Vec::new())]);
        let mut c = Connection::new(stream, peer(), LIMITS);
        assert!(matches!(c.read_available(), Err(ConnectionError::Closed)));
        // Data read before the close is still buffered
        assert_eq!(c.received(), 7);
    }

    #[test]
    fn test_read_available_reports_error() {
        let stream = ScriptedStream::new(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Err(io::ErrorKind::ConnectionReset.into()),
        ]);
        let mut c = Connection::new(stream, peer(), LIMITS);
        match c.read_available() {
            Err(ConnectionError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_read_available_overflow() {
        let stream = ScriptedStream::new(vec![Ok(vec![b'x'; 100])]);
        let mut c = Connection::new(stream, peer(), LIMITS);
        assert!(matches!(c.read_available(), Err(ConnectionError::Overflow(64))));
        assert_eq!(c.received(), LIMITS.max_request_size);
    }

    #[test]
    fn test_read_available_large_stream_of_records() {
        // More total data than the buffer holds, but every line fits
        let mut data = Vec::new();
        for i in 0..20 {
            data.extend_from_slice(format!("email:user{i}@x.com\r\n").as_bytes());
        }
        let stream = ScriptedStream::new(vec![Ok(data)]);
        let mut c = Connection::new(stream, peer(), LIMITS);
        c.read_available().unwrap();
        assert_eq!(c.email(), Some("user19@x.com"));
        assert_eq!(c.received(), 0);
    }

    #[test]
    fn test_registry_get_or_create() {
        let mut registry: ConnectionRegistry<()> = ConnectionRegistry::new(Some(2));

        let (id1, _) = registry.get_or_create(None, conn).unwrap();
        let (id2, _) = registry.get_or_create(None, conn).unwrap();
        assert_ne!(id1, id2);

        // At capacity
        assert_eq!(
            registry.get_or_create(None, conn).err(),
            Some(RegistryError::Full(2))
        );

        // Existing id is looked up, not created
        let (found, c) = registry
            .get_or_create(Some(id1), || panic!("must not create"))
            .unwrap();
        assert_eq!(found, id1);
        c.ingest(b"email:a@b.com\r\n").unwrap();
        assert_eq!(registry.get(id1).unwrap().email(), Some("a@b.com"));

        assert_eq!(
            registry.get_or_create(Some(99), conn).err(),
            Some(RegistryError::NotFound(99))
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unbounded_registry_never_full() {
        let mut registry: ConnectionRegistry<()> = ConnectionRegistry::new(None);
        for _ in 0..2048 {
            assert!(registry.get_or_create(None, conn).is_ok());
        }
        assert_eq!(registry.len(), 2048);
        assert_eq!(registry.capacity(), None);
    }

    #[test]
    fn test_registry_remove() {
        let mut registry: ConnectionRegistry<()> = ConnectionRegistry::new(Some(4));
        let (id, _) = registry.get_or_create(None, conn).unwrap();

        assert!(registry.remove(id).is_ok());
        assert!(!registry.contains(id));
        assert!(registry.is_empty());

        // Second removal is an invariant violation, not a double close
        assert_eq!(registry.remove(id).err(), Some(RegistryError::NotFound(id)));
    }

    #[test]
    fn test_remove_leaves_other_connections_untouched() {
        let mut registry: ConnectionRegistry<()> = ConnectionRegistry::new(Some(4));
        let (a, c) = registry.get_or_create(None, conn).unwrap();
        c.ingest(b"email:a@b.com\r\nemail:par").unwrap();
        let (b, _) = registry.get_or_create(None, conn).unwrap();

        registry.remove(b).unwrap();

        let c = registry.get(a).unwrap();
        assert_eq!(c.email(), Some("a@b.com"));
        assert_eq!(c.received(), 9);
        assert_eq!(registry.iter().count(), 1);
        assert_eq!(registry.capacity(), Some(4));
    }
}
