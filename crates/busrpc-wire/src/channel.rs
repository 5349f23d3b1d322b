//! Channel naming.
//!
//! A broadcast of logical event `E` is published on channel `E`; a message
//! addressed to process `P` is published on `E:P`. Every process subscribes
//! to both forms for each event it handles.

use std::fmt;

/// Logical channel families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Presence announcement, broadcast on `connect()`.
    Connect,
    /// Reply to a presence announcement, addressed to the newcomer.
    Info,
    /// Departure announcement, broadcast on `close()`.
    Disconnect,
    /// Arbitrary named message.
    Message,
    /// Remote method invocation.
    Call,
    /// Result of a remote method invocation.
    Response,
}

impl Event {
    /// Every channel family, in subscription order.
    pub const ALL: [Event; 6] = [
        Event::Connect,
        Event::Info,
        Event::Disconnect,
        Event::Message,
        Event::Call,
        Event::Response,
    ];

    /// The bare channel name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Connect => "rp:connect",
            Event::Info => "rp:info",
            Event::Disconnect => "rp:disconnect",
            Event::Message => "rp:message",
            Event::Call => "rp:call",
            Event::Response => "rp:response",
        }
    }

    /// Channel for a broadcast of this event.
    pub fn broadcast_channel(&self) -> String {
        self.as_str().to_string()
    }

    /// Channel for this event addressed to `pid`.
    pub fn targeted_channel(&self, pid: &str) -> String {
        format!("{}:{}", self.as_str(), pid)
    }

    /// Resolve an inbound channel name as seen by process `pid`.
    ///
    /// Only the bare name and the `pid`-suffixed name match; a channel
    /// addressed to another process yields `None`.
    pub fn from_channel(channel: &str, pid: &str) -> Option<Event> {
        Event::ALL.into_iter().find(|event| {
            let name = event.as_str();
            match channel.strip_prefix(name) {
                Some("") => true,
                Some(rest) => rest.strip_prefix(':') == Some(pid),
                None => false,
            }
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All channels a process with id `pid` subscribes to.
pub fn subscription_channels(pid: &str) -> Vec<String> {
    Event::ALL
        .iter()
        .flat_map(|event| [event.broadcast_channel(), event.targeted_channel(pid)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(Event::Call.broadcast_channel(), "rp:call");
        assert_eq!(Event::Call.targeted_channel("p2"), "rp:call:p2");
        assert_eq!(Event::Response.to_string(), "rp:response");
    }

    #[test]
    fn test_from_channel() {
        assert_eq!(Event::from_channel("rp:info:p1", "p1"), Some(Event::Info));
        assert_eq!(Event::from_channel("rp:connect", "p1"), Some(Event::Connect));
        assert_eq!(Event::from_channel("rp:info:p2", "p1"), None);
        assert_eq!(Event::from_channel("rp:infos", "p1"), None);
        assert_eq!(Event::from_channel("other", "p1"), None);
    }

    #[test]
    fn test_from_channel_pid_with_colon() {
        assert_eq!(
            Event::from_channel("rp:call:host:42", "host:42"),
            Some(Event::Call)
        );
    }

    #[test]
    fn test_subscription_channels() {
        let channels = subscription_channels("p1");
        assert_eq!(channels.len(), 12);
        assert!(channels.contains(&"rp:disconnect".to_string()));
        assert!(channels.contains(&"rp:response:p1".to_string()));
    }
}
