use std::time::Duration;

/// Bus address this software answers to. The wire protocol calls it the "plugin" address.
pub const PLUGIN_ADDRESS: u8 = 33;
/// Address of the outdoor control panel.
pub const OCP_ADDRESS: u8 = 16;
/// Destination for frames every station on the bus should look at.
pub const BROADCAST_ADDRESS: u8 = 15;

/// A de-framed, checksum-validated message as handed over by the transport.
///
/// Byte framing, checksums and the physical port live behind [`crate::bus::Transport`];
/// from here on up a message is just addressing, an action code and a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: u8,
    pub dest: u8,
    pub action: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(source: u8, dest: u8, action: u8, payload: Vec<u8>) -> Self {
        Self { source, dest, action, payload }
    }

    pub fn payload_byte(&self, index: usize) -> Option<u8> {
        self.payload.get(index).copied()
    }
}

/// Structural matcher describing the reply an [`Outbound`] expects.
///
/// Source and destination match exactly when given; the action always matches exactly.
/// The payload prefix is for action codes that are reused across several semantic
/// replies (category acks carry the category and item in the first payload bytes).
#[derive(Debug, Clone)]
pub struct ResponseMatch {
    pub source: Option<u8>,
    pub dest: Option<u8>,
    pub action: u8,
    pub payload_prefix: Vec<u8>,
    pub timeout: Duration,
}

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

impl ResponseMatch {
    pub fn action(action: u8) -> Self {
        Self {
            source: None,
            dest: None,
            action,
            payload_prefix: Vec::new(),
            timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.payload_prefix = prefix.to_vec();
        self
    }

    pub fn with_source(mut self, source: u8) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        if frame.action != self.action {
            return false;
        }
        if self.source.is_some_and(|s| s != frame.source) {
            return false;
        }
        if self.dest.is_some_and(|d| d != frame.dest) {
            return false;
        }
        frame.payload.starts_with(&self.payload_prefix)
    }
}

/// One logical request to the panel, owned by the issuer until handed to the bus.
///
/// Construction validates nothing about wire legality; the family dialect that built
/// the payload is responsible for that. `retries` is the number of re-sends after the
/// initial attempt; exactly one completion outcome is reported across the whole
/// attempt cycle.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub source: u8,
    pub dest: u8,
    pub action: u8,
    pub payload: Vec<u8>,
    pub retries: u8,
    pub response: Option<ResponseMatch>,
}

impl Outbound {
    pub fn new(action: u8, payload: Vec<u8>) -> Self {
        Self {
            source: PLUGIN_ADDRESS,
            dest: OCP_ADDRESS,
            action,
            payload,
            retries: 0,
            response: None,
        }
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_response(mut self, response: ResponseMatch) -> Self {
        self.response = Some(response);
        self
    }

    pub fn frame(&self) -> Frame {
        Frame::new(self.source, self.dest, self.action, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_on_action_and_prefix() {
        let m = ResponseMatch::action(30).with_prefix(&[4, 2]);
        assert!(m.matches(&Frame::new(16, 33, 30, vec![4, 2, 9])));
        assert!(!m.matches(&Frame::new(16, 33, 30, vec![4, 3])));
        assert!(!m.matches(&Frame::new(16, 33, 31, vec![4, 2])));
        // A payload shorter than the prefix cannot match.
        assert!(!m.matches(&Frame::new(16, 33, 30, vec![4])));
    }

    #[test]
    fn source_and_dest_are_optional() {
        let m = ResponseMatch::action(1).with_source(16);
        assert!(m.matches(&Frame::new(16, 33, 1, vec![])));
        assert!(!m.matches(&Frame::new(17, 33, 1, vec![])));
    }
}
