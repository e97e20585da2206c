//! Non-blocking I/O steps over a raw socket and a rustls client session.
//!
//! Every step makes as much progress as the socket allows right now and
//! reports what it is waiting for as an [`IoOutcome`]. The caller (the
//! transport's driver loop) turns `WouldBlockOnRead` / `WouldBlockOnWrite`
//! into the matching reactor wait and calls the step again. A TLS session
//! may need to write while the application reads (and vice versa), so a read
//! step can legitimately report `WouldBlockOnWrite`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::TransportError;

/// Result of a single non-blocking I/O attempt.
#[derive(Debug)]
pub enum IoOutcome {
    /// The step completed; the value is step-specific (bytes read, bytes
    /// accepted). A read that progresses with `0` means end of stream.
    Progressed(usize),
    WouldBlockOnRead,
    WouldBlockOnWrite,
    Fatal(TransportError),
}

/// `io::Read`/`io::Write` view of a tokio socket that never waits.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn raw_read_step(sock: &TcpStream, buf: &mut [u8]) -> IoOutcome {
    match sock.try_read(buf) {
        Ok(n) => IoOutcome::Progressed(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlockOnRead,
        Err(e) => IoOutcome::Fatal(e.into()),
    }
}

pub fn raw_write_step(sock: &TcpStream, data: &[u8]) -> IoOutcome {
    match sock.try_write(data) {
        Ok(0) if !data.is_empty() => {
            IoOutcome::Fatal(io::Error::from(io::ErrorKind::WriteZero).into())
        }
        Ok(n) => IoOutcome::Progressed(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlockOnWrite,
        Err(e) => IoOutcome::Fatal(e.into()),
    }
}

/// A rustls client session layered on the transport's socket.
pub struct TlsEngine {
    conn: ClientConnection,
    close_notify_sent: bool,
    truncated: bool,
}

impl TlsEngine {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, TransportError> {
        let conn = ClientConnection::new(config, server_name)?;
        Ok(Self {
            conn,
            close_notify_sent: false,
            truncated: false,
        })
    }

    /// Drive the handshake. Completes with `Progressed(0)` once the session
    /// is established and every handshake record has been written.
    pub fn handshake_step(&mut self, sock: &TcpStream) -> IoOutcome {
        loop {
            if let Some(blocked) = self.flush_tls(sock) {
                return blocked;
            }
            if !self.conn.is_handshaking() {
                return IoOutcome::Progressed(0);
            }
            match self.conn.read_tls(&mut SocketIo(sock)) {
                Ok(0) => return IoOutcome::Fatal(TransportError::HandshakeEof),
                Ok(_) => {
                    if let Err(fatal) = self.process(sock) {
                        return fatal;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return IoOutcome::WouldBlockOnRead
                }
                Err(e) => return IoOutcome::Fatal(e.into()),
            }
        }
    }

    /// Read decrypted application data into `buf`.
    pub fn read_step(&mut self, sock: &TcpStream, buf: &mut [u8]) -> IoOutcome {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return IoOutcome::Progressed(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.truncated = true;
                    return IoOutcome::Progressed(0);
                }
                Err(e) => return IoOutcome::Fatal(e.into()),
            }

            // Alerts or key updates may have to go out before more can be read.
            if let Some(blocked) = self.flush_tls(sock) {
                return blocked;
            }

            match self.conn.read_tls(&mut SocketIo(sock)) {
                Ok(0) => {
                    debug!("TLS peer closed the socket without close_notify");
                    self.truncated = true;
                    return IoOutcome::Progressed(0);
                }
                Ok(_) => {
                    if let Err(fatal) = self.process(sock) {
                        return fatal;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return IoOutcome::WouldBlockOnRead
                }
                Err(e) => return IoOutcome::Fatal(e.into()),
            }
        }
    }

    /// Hand `data` to the session and push out whatever the socket accepts.
    /// Reports how many bytes of `data` the session took ownership of.
    pub fn write_step(&mut self, sock: &TcpStream, data: &[u8]) -> IoOutcome {
        if let Some(blocked) = self.flush_tls(sock) {
            return blocked;
        }
        let accepted = match self.conn.writer().write(data) {
            Ok(n) => n,
            Err(e) => return IoOutcome::Fatal(e.into()),
        };
        if accepted == 0 && !data.is_empty() {
            return IoOutcome::WouldBlockOnWrite;
        }
        match self.flush_tls(sock) {
            None | Some(IoOutcome::WouldBlockOnWrite) => IoOutcome::Progressed(accepted),
            Some(other) => other,
        }
    }

    /// Push out every pending TLS record.
    pub fn flush_step(&mut self, sock: &TcpStream) -> IoOutcome {
        self.flush_tls(sock).unwrap_or(IoOutcome::Progressed(0))
    }

    /// Two-way shutdown: send close_notify, then wait for the peer's.
    pub fn shutdown_step(&mut self, sock: &TcpStream) -> IoOutcome {
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }
        if let Some(blocked) = self.flush_tls(sock) {
            return blocked;
        }
        if self.truncated {
            return IoOutcome::Progressed(0);
        }

        let mut scratch = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut scratch) {
                Ok(0) => return IoOutcome::Progressed(0),
                Ok(n) => debug!(bytes = n, "Discarding application data received during shutdown"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.conn.read_tls(&mut SocketIo(sock)) {
                        Ok(0) => return IoOutcome::Progressed(0),
                        Ok(_) => {
                            if let Err(fatal) = self.process(sock) {
                                return fatal;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return IoOutcome::WouldBlockOnRead
                        }
                        Err(e) => return IoOutcome::Fatal(e.into()),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return IoOutcome::Progressed(0)
                }
                Err(e) => return IoOutcome::Fatal(e.into()),
            }
        }
    }

    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.conn.peer_certificates().map(|certs| certs.to_vec())
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.conn.protocol_version().map(|v| format!("{:?}", v))
    }

    pub fn cipher_suite(&self) -> Option<String> {
        self.conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    pub fn has_pending_output(&self) -> bool {
        self.conn.wants_write()
    }

    fn process(&mut self, sock: &TcpStream) -> Result<(), IoOutcome> {
        match self.conn.process_new_packets() {
            Ok(_) => Ok(()),
            Err(e) => {
                // Best effort: let the peer see the alert before we drop the socket.
                let _ = self.conn.write_tls(&mut SocketIo(sock));
                Err(IoOutcome::Fatal(e.into()))
            }
        }
    }

    fn flush_tls(&mut self, sock: &TcpStream) -> Option<IoOutcome> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SocketIo(sock)) {
                Ok(0) => {
                    return Some(IoOutcome::Fatal(
                        io::Error::from(io::ErrorKind::WriteZero).into(),
                    ))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Some(IoOutcome::WouldBlockOnWrite)
                }
                Err(e) => return Some(IoOutcome::Fatal(e.into())),
            }
        }
        None
    }
}
