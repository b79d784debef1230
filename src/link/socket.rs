//! Per-socket connection state and raw/TLS I/O.
//!
//! A [`Connection`] owns exactly one non-blocking socket and translates the
//! link's generic send/receive operations into the right raw or TLS-wrapped
//! calls. All bookkeeping across connections lives in the
//! [`Link`](super::Link).

use super::ConnId;

use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use tracing::trace;

// What a connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Role {
    /// This side initiated the connection; carries the address the connector
    /// was registered under.
    Connector { address: SocketAddr },
    /// Accepted from one of the link's listeners.
    Accepted,
}

// Where a connection is in its lifecycle. The phase is the single source of
// truth for dispatch decisions; a socket is never a member of several
// bookkeeping sets that could disagree about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    /// Non-blocking connect issued, waiting for writability.
    Connecting,
    /// TCP established, TLS handshake in flight.
    Handshaking,
    /// Usable for application data; the only phase with a public conn id.
    Established,
}

// Outcome of flushing the pending send buffer.
pub(super) enum SendProgress {
    /// Everything queued has been handed to the transport.
    Done,
    /// Bytes remain (or TLS records remain unflushed); wait for writability.
    Pending,
}

// Outcome of one receive round.
pub(super) enum RecvOutcome {
    /// Everything the socket had to offer; `closed` when end-of-stream was
    /// reached right after the data, since no further event will announce it.
    Data { data: Vec<u8>, closed: bool },
    /// The peer closed the connection (0-byte read or TLS close_notify).
    Closed,
    /// Nothing available yet; wait for the next readiness event.
    NotReady,
}

// Outcome of one TLS handshake step.
pub(super) enum HandshakeProgress {
    /// Still negotiating; the socket should be watched with this interest.
    InProgress(Interest),
    Done,
    /// Malformed handshake or peer gone; never fatal for the reactor.
    Failed,
}

#[derive(Debug)]
pub(super) struct Connection {
    pub stream: TcpStream,
    pub role: Role,
    pub phase: Phase,
    pub tls: Option<rustls::Connection>,
    pub conn_id: Option<ConnId>,
    pub interest: Interest,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    send_buf: Vec<u8>,
    send_pos: usize,
    send_finished: bool,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        role: Role,
        phase: Phase,
        interest: Interest,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            stream,
            role,
            phase,
            tls: None,
            conn_id: None,
            interest,
            local_addr,
            peer_addr,
            send_buf: Vec::new(),
            send_pos: 0,
            send_finished: true,
        }
    }

    /// Whether the previous send has fully completed.
    pub fn send_finished(&self) -> bool {
        self.send_finished
    }

    /// Accepts a new payload for sending.
    ///
    /// Returns the payload back if the previous send is still in flight; the
    /// caller turns that into the contract-violation error.
    pub fn queue_send(&mut self, data: Vec<u8>) -> Result<(), Vec<u8>> {
        if !self.send_finished {
            return Err(data);
        }
        self.send_finished = false;
        self.send_buf = data;
        self.send_pos = 0;
        Ok(())
    }

    /// Marks the current send as complete and returns its total size.
    pub fn finish_send(&mut self) -> usize {
        let sent = self.send_buf.len();
        self.send_buf = Vec::new();
        self.send_pos = 0;
        self.send_finished = true;
        sent
    }

    /// Pushes as much of the pending send as the transport accepts right now.
    pub fn flush_send(&mut self) -> io::Result<SendProgress> {
        if let Some(tls) = self.tls.as_mut() {
            loop {
                // feed plaintext into the session
                while self.send_pos < self.send_buf.len() {
                    match tls.writer().write(&self.send_buf[self.send_pos..]) {
                        Ok(0) => break, // session buffer is full, drain it below
                        Ok(n) => {
                            self.send_pos += n;
                            trace!(len = n, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "wrote plaintext to TLS");
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(err) => return Err(err),
                    }
                }
                if !tls.wants_write() {
                    break;
                }
                // push encrypted records to the socket
                match tls.write_tls(&mut self.stream) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!(len = n, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "wrote encrypted data to socket");
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        return Ok(SendProgress::Pending)
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            }
            if self.send_pos == self.send_buf.len() && !tls.wants_write() {
                Ok(SendProgress::Done)
            } else {
                Ok(SendProgress::Pending)
            }
        } else {
            while self.send_pos < self.send_buf.len() {
                match self.stream.write(&self.send_buf[self.send_pos..]) {
                    // the kernel refused a non-empty write; wait for readiness
                    Ok(0) => return Ok(SendProgress::Pending),
                    Ok(n) => {
                        self.send_pos += n;
                        trace!(len = n, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "wrote to socket");
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        return Ok(SendProgress::Pending)
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(SendProgress::Done)
        }
    }

    /// Drains everything the socket has to offer, in `block_size` chunks.
    ///
    /// Readiness is edge-triggered: a burst larger than one read must be
    /// consumed down to `WouldBlock` here, because no further event will
    /// announce the remainder once the peer goes quiet.
    pub fn recv(&mut self, block_size: usize) -> io::Result<RecvOutcome> {
        if let Some(tls) = self.tls.as_mut() {
            let mut closed = false;
            loop {
                match tls.read_tls(&mut self.stream) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        trace!(len = n, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "read encrypted data from socket");
                        match tls.process_new_packets() {
                            Ok(state) => {
                                if state.peer_has_closed() {
                                    closed = true;
                                    break;
                                }
                            }
                            // surface TLS protocol errors as InvalidData so
                            // the link closes the connection instead of
                            // aborting
                            Err(err) => return Err(io::Error::new(ErrorKind::InvalidData, err)),
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            }

            // drain whatever plaintext the session holds
            let mut buf = Vec::new();
            let mut pos = 0;
            loop {
                buf.resize(pos + block_size, 0);
                match tls.reader().read(&mut buf[pos..]) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => pos += n,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err),
                }
            }
            buf.truncate(pos);

            if !buf.is_empty() {
                Ok(RecvOutcome::Data { data: buf, closed })
            } else if closed {
                Ok(RecvOutcome::Closed)
            } else {
                Ok(RecvOutcome::NotReady)
            }
        } else {
            let mut data = Vec::new();
            let mut closed = false;
            let mut chunk = vec![0u8; block_size];
            loop {
                match self.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        trace!(len = n, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "read data from socket");
                        data.extend_from_slice(&chunk[..n]);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            }
            if !data.is_empty() {
                Ok(RecvOutcome::Data { data, closed })
            } else if closed {
                Ok(RecvOutcome::Closed)
            } else {
                Ok(RecvOutcome::NotReady)
            }
        }
    }

    /// Advances the TLS handshake by one step.
    ///
    /// Flushes pending handshake records, feeds one read round into the
    /// session and reports which readiness interest the socket needs next.
    pub fn step_handshake(&mut self) -> io::Result<HandshakeProgress> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(HandshakeProgress::Done);
        };

        while tls.wants_write() {
            match tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(HandshakeProgress::InProgress(Interest::WRITABLE))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if is_expected_disconnect(&err) => return Ok(HandshakeProgress::Failed),
                Err(err) => return Err(err),
            }
        }

        // drain incoming records down to WouldBlock; the readiness edge has
        // already fired and will not repeat for bytes left in the buffer
        while tls.is_handshaking() {
            match tls.read_tls(&mut self.stream) {
                // peer went away mid-handshake
                Ok(0) => return Ok(HandshakeProgress::Failed),
                Ok(_) => {
                    if tls.process_new_packets().is_err() {
                        return Ok(HandshakeProgress::Failed);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if is_expected_disconnect(&err) => return Ok(HandshakeProgress::Failed),
                Err(err) => return Err(err),
            }
        }

        // the step may have produced output (ServerHello, Finished, ...)
        while tls.wants_write() {
            match tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(HandshakeProgress::InProgress(Interest::WRITABLE))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if is_expected_disconnect(&err) => return Ok(HandshakeProgress::Failed),
                Err(err) => return Err(err),
            }
        }

        if tls.is_handshaking() {
            Ok(HandshakeProgress::InProgress(Interest::READABLE))
        } else {
            Ok(HandshakeProgress::Done)
        }
    }
}

// ============================================================================
// Socket-Error Classification
// ============================================================================

/// The fixed set of errors meaning "the peer is gone": treated as an ordinary,
/// silent connection closure everywhere in the link.
pub(super) fn is_expected_disconnect(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
    ) {
        return true;
    }
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return code == libc::ESHUTDOWN || code == libc::EBADF;
    }
    false
}

/// Connect-attempt outcomes that feed the reconnection scheduler instead of
/// aborting the loop.
pub(super) fn is_connect_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_gone_errors_are_expected() {
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionAborted,
            ErrorKind::NotConnected,
            ErrorKind::BrokenPipe,
        ] {
            assert!(is_expected_disconnect(&io::Error::from(kind)));
        }
        assert!(!is_expected_disconnect(&io::Error::from(
            ErrorKind::PermissionDenied
        )));
        assert!(!is_expected_disconnect(&io::Error::from(
            ErrorKind::WouldBlock
        )));
    }

    #[cfg(unix)]
    #[test]
    fn peer_gone_errno_codes_are_expected() {
        assert!(is_expected_disconnect(&io::Error::from_raw_os_error(
            libc::ESHUTDOWN
        )));
        assert!(is_expected_disconnect(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }

    #[test]
    fn connect_failures_are_not_fatal() {
        assert!(is_connect_failure(ErrorKind::ConnectionRefused));
        assert!(is_connect_failure(ErrorKind::TimedOut));
        assert!(!is_connect_failure(ErrorKind::PermissionDenied));
    }
}
