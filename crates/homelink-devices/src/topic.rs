//! Bus topic grammar: `<NAMESPACE>/<deviceTopic>/<channel>`.

/// Known namespaces (compared case-insensitively).
pub mod namespaces {
    /// Device-originated results.
    pub const STAT: &str = "STAT";
    /// Telemetry, including last-will connectivity notices.
    pub const TELE: &str = "TELE";
    /// Outbound commands.
    pub const CMND: &str = "CMND";
}

/// Channels with special meaning.
pub mod channels {
    pub const RESULT: &str = "RESULT";
    pub const LWT: &str = "LWT";
    pub const STATE: &str = "STATE";
}

/// Classified namespace of an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    Stat,
    Tele,
    Cmnd,
    Other(String),
}

/// A topic split into its three parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicParts<'a> {
    pub namespace: &'a str,
    pub device: &'a str,
    /// Everything after the device segment.
    pub channel: &'a str,
}

impl<'a> TopicParts<'a> {
    /// Split a topic. Returns `None` when any of the three parts is missing.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut parts = topic.splitn(3, '/');
        let namespace = parts.next().filter(|s| !s.is_empty())?;
        let device = parts.next().filter(|s| !s.is_empty())?;
        let channel = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            namespace,
            device,
            channel,
        })
    }

    pub fn kind(&self) -> Namespace {
        let ns = self.namespace;
        if ns.eq_ignore_ascii_case(namespaces::STAT) {
            Namespace::Stat
        } else if ns.eq_ignore_ascii_case(namespaces::TELE) {
            Namespace::Tele
        } else if ns.eq_ignore_ascii_case(namespaces::CMND) {
            Namespace::Cmnd
        } else {
            Namespace::Other(ns.to_string())
        }
    }

    pub fn channel_is(&self, channel: &str) -> bool {
        self.channel.eq_ignore_ascii_case(channel)
    }
}

/// Canonical form of a device topic or port name.
pub fn canonical(name: &str) -> String {
    name.trim().to_uppercase()
}
