//! Datagram emission to the local collector daemon.
//!
//! Documents travel over UDP to a daemon on the same host, one document per
//! datagram, each prefixed with a one-line protocol header. Emission is fire
//! and forget: the tracing library must never take an application down, so
//! every failure here is logged and swallowed.

use std::net::UdpSocket;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::streaming::Document;
use crate::util::acquire;

/// Prefixed to every datagram so the daemon can identify the payload format.
const PROTOCOL_HEADER: &[u8] = b"{\"format\":\"json\",\"version\":1}\n";

/// Documents larger than this would be truncated by the daemon's receive
/// buffer; they are dropped with a warning instead.
const MAX_PACKET_BYTES: usize = 64_000;

const SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// A UDP client for the collector daemon.
///
/// The socket is dialed lazily on the first emission and redialed after a
/// send failure. A shared scratch buffer is reused across emissions so the
/// steady state allocates nothing per document.
#[derive(Debug)]
pub struct Emitter {
    address: String,
    conn: Mutex<Option<UdpSocket>>,
    buffer: Mutex<Vec<u8>>,
}

impl Emitter {
    /// An emitter targeting `address` (`host:port`). No I/O happens until
    /// the first document is emitted.
    pub fn new(address: impl Into<String>) -> Self {
        Emitter {
            address: address.into(),
            conn: Mutex::new(None),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// An emitter whose datagrams go nowhere, for trees built in tests.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        Emitter::new("127.0.0.1:0")
    }

    /// The configured daemon address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Serializes `document` and sends it as a single datagram. Failures are
    /// logged at `warn` and the document is dropped.
    pub fn emit(&self, document: &Document) {
        let buffer = {
            let mut buffer = acquire(&self.buffer);
            buffer.clear();
            buffer.extend_from_slice(PROTOCOL_HEADER);
            if let Err(err) = serde_json::to_writer(&mut *buffer, document) {
                warn!(segment = %document.name, error = %err, "failed to serialize document");
                return;
            }
            buffer
        };
        if buffer.len() > MAX_PACKET_BYTES {
            warn!(
                segment = %document.name,
                bytes = buffer.len(),
                "document exceeds the maximum datagram size; dropped"
            );
            return;
        }

        let mut conn = acquire(&self.conn);
        if conn.is_none() {
            match self.dial() {
                Ok(socket) => *conn = Some(socket),
                Err(err) => {
                    warn!(address = %self.address, error = %err, "failed to dial the collector daemon");
                    return;
                }
            }
        }
        let Some(socket) = conn.as_ref() else {
            return;
        };
        if let Err(err) = socket.send(&buffer) {
            warn!(address = %self.address, error = %err, "failed to send document");
            // drop the socket so the next emission redials
            *conn = None;
        }
    }

    fn dial(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(&self.address)?;
        socket.set_write_timeout(Some(SEND_TIMEOUT))?;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(name: &str) -> Document {
        Document {
            name: name.into(),
            id: "03babb4ba280be51".into(),
            start_time: 1.0,
            end_time: Some(2.0),
            ..Default::default()
        }
    }

    #[test]
    fn emits_a_header_prefixed_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let emitter = Emitter::new(server.local_addr().unwrap().to_string());

        emitter.emit(&document("api"));

        let mut buf = [0u8; 65_536];
        let n = server.recv(&mut buf).unwrap();
        let payload = &buf[..n];
        assert!(payload.starts_with(PROTOCOL_HEADER));
        let decoded: Document =
            serde_json::from_slice(&payload[PROTOCOL_HEADER.len()..]).unwrap();
        assert_eq!(decoded.name, "api");
    }

    #[test]
    fn reuses_the_socket_across_emissions() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let emitter = Emitter::new(server.local_addr().unwrap().to_string());

        emitter.emit(&document("first"));
        emitter.emit(&document("second"));

        let mut buf = [0u8; 65_536];
        let first_peer = server.recv_from(&mut buf).unwrap().1;
        let second_peer = server.recv_from(&mut buf).unwrap().1;
        assert_eq!(first_peer, second_peer);
    }

    #[test]
    fn oversized_documents_are_dropped() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let emitter = Emitter::new(server.local_addr().unwrap().to_string());

        let mut big = document("big");
        big.annotations
            .insert("blob".into(), "x".repeat(MAX_PACKET_BYTES).into());
        emitter.emit(&big);

        let mut buf = [0u8; 65_536];
        assert!(server.recv(&mut buf).is_err());
    }

    #[test]
    fn unresolvable_addresses_do_not_panic() {
        let emitter = Emitter::new("definitely-not-a-host:2000");
        emitter.emit(&document("lost"));
    }
}
