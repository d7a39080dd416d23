//! STOMP frame model.
//!
//! A frame is a command line, an ordered list of `key:value` headers, and an
//! opaque body. Header order is preserved: MESSAGE frames must carry the
//! originating SEND headers in the order the client wrote them.

use bytes::Bytes;

// ---------------------------------------------------------------------------
// Commands and well-known headers
// ---------------------------------------------------------------------------

/// Inbound and outbound STOMP command strings.
pub mod command {
    pub const CONNECT: &str = "CONNECT";
    pub const STOMP: &str = "STOMP";
    pub const SEND: &str = "SEND";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const ACK: &str = "ACK";
    pub const BEGIN: &str = "BEGIN";
    pub const COMMIT: &str = "COMMIT";
    pub const ABORT: &str = "ABORT";
    pub const DISCONNECT: &str = "DISCONNECT";

    pub const CONNECTED: &str = "CONNECTED";
    pub const MESSAGE: &str = "MESSAGE";
    pub const RECEIPT: &str = "RECEIPT";
    pub const ERROR: &str = "ERROR";
}

/// Header names this core reads or writes.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const HOST: &str = "host";
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const HEART_BEAT: &str = "heart-beat";

    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const ACK: &str = "ack";
    pub const SELECTOR: &str = "selector";
    pub const PERSISTENT: &str = "persistent";
    pub const TRANSACTION: &str = "transaction";
    pub const RECEIPT: &str = "receipt";
    pub const CONTENT_LENGTH: &str = "content-length";

    pub const VERSION: &str = "version";
    pub const SESSION: &str = "session";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const RECEIPT_ID: &str = "receipt-id";
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A parsed or to-be-encoded STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`, if present. Repeated headers keep the first
    /// occurrence authoritative, per the STOMP spec.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the first occurrence of `name`, or append it.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        if let Some(slot) = self.headers.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.into();
        } else {
            self.headers.push((name.to_string(), value.into()));
        }
    }

    /// Remove every occurrence of `name`, returning the first value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self
            .headers
            .iter()
            .position(|(k, _)| k == name)
            .map(|i| self.headers.remove(i).1);
        self.headers.retain(|(k, _)| k != name);
        first
    }

    /// Approximate wire size, used for delivery accounting.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        self.command.len() + headers + self.body.len() + 3
    }

    // -----------------------------------------------------------------------
    // Outbound constructors
    // -----------------------------------------------------------------------

    pub fn connected(version: &str, session: &str, heart_beat: &str) -> Self {
        Frame::new(command::CONNECTED)
            .header(header::VERSION, version)
            .header(header::SESSION, session)
            .header(header::HEART_BEAT, heart_beat)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(command::RECEIPT).header(header::RECEIPT_ID, receipt_id)
    }

    pub fn error(message: &str) -> Self {
        Frame::new(command::ERROR).header(header::MESSAGE, message)
    }
}

/// Wire-level item: a full frame or a bare `\n` keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    Heartbeat,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_keeps_first_occurrence() {
        let frame = Frame::new(command::SEND)
            .header("destination", "/queue/a")
            .header("destination", "/queue/b");
        assert_eq!(frame.get("destination"), Some("/queue/a"));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut frame = Frame::new(command::MESSAGE).header("message-id", "msg:1");
        frame.set("message-id", "msg:2");
        assert_eq!(frame.get("message-id"), Some("msg:2"));
        assert_eq!(frame.headers.len(), 1);
    }

    #[test]
    fn remove_drops_all_occurrences() {
        let mut frame = Frame::new(command::SEND)
            .header("transaction", "tx1")
            .header("transaction", "tx2");
        assert_eq!(frame.remove("transaction"), Some("tx1".to_string()));
        assert!(!frame.has("transaction"));
    }

    #[test]
    fn connected_carries_negotiated_headers() {
        let frame = Frame::connected("1.1", "host:7", "100,10000");
        assert_eq!(frame.get("version"), Some("1.1"));
        assert_eq!(frame.get("session"), Some("host:7"));
        assert_eq!(frame.get("heart-beat"), Some("100,10000"));
    }
}
