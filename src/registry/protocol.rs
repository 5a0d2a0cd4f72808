//! Discovery wire messages.

use std::fmt;
use std::str::FromStr;

use crate::description::ServiceDescription;
use crate::filter::ServiceFilter;
use crate::message::{keys, Message, SubscriberId};
use crate::Error;

/// Value of `um.rpc.type` on the discovery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Discover,
    StartDiscovery,
    StopDiscovery,
    Discovered,
    Vanished,
}

impl MessageKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::StartDiscovery => "startDiscovery",
            Self::StopDiscovery => "stopDiscovery",
            Self::Discovered => "discovered",
            Self::Vanished => "vanished",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "discover" => Self::Discover,
            "startDiscovery" => Self::StartDiscovery,
            "stopDiscovery" => Self::StopDiscovery,
            "discovered" => Self::Discovered,
            "vanished" => Self::Vanished,
            other => return Err(Error::malformed(format!("unknown discovery type '{other}'"))),
        })
    }
}

/// Filter message of kind `kind` sent by `mgr`.
pub(crate) fn query(kind: MessageKind, filter: &ServiceFilter, mgr: &SubscriberId) -> Message {
    let mut msg = filter.to_message();
    msg.put_meta(keys::TYPE, kind.as_str())
        .put_meta(keys::MGR_ID, mgr.as_str());
    msg
}

/// One-shot lookup request.
pub(crate) fn discover(filter: &ServiceFilter, req_id: &str, mgr: &SubscriberId) -> Message {
    let mut msg = query(MessageKind::Discover, filter, mgr);
    msg.put_meta(keys::REQ_ID, req_id);
    msg
}

/// Answer to a `discover` request.
pub(crate) fn found(desc: &ServiceDescription, req_id: &str, mgr: &SubscriberId) -> Message {
    let mut msg = desc.to_message();
    msg.put_meta(keys::RESP_ID, req_id)
        .put_meta(keys::MGR_ID, mgr.as_str());
    msg
}

/// `discovered`/`vanished` notification for the continuous query `filter_id`.
pub(crate) fn notify(
    kind: MessageKind,
    desc: &ServiceDescription,
    filter_id: &str,
    mgr: &SubscriberId,
) -> Message {
    let mut msg = desc.to_message();
    msg.put_meta(keys::TYPE, kind.as_str())
        .put_meta(keys::FILTER_ID, filter_id)
        .put_meta(keys::MGR_ID, mgr.as_str());
    msg
}

/// Id of the filter carried by a `stopDiscovery` message.
pub(crate) fn filter_id(msg: &Message) -> Option<&str> {
    msg.meta_with_prefix(keys::FILTER_PREFIX)
        .find(|(k, _)| *k == "uuid")
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_back() {
        for kind in [
            MessageKind::Discover,
            MessageKind::StartDiscovery,
            MessageKind::StopDiscovery,
            MessageKind::Discovered,
            MessageKind::Vanished,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("rediscover".parse::<MessageKind>().is_err());
    }

    #[test]
    fn stop_message_carries_filter_id() {
        let filter = ServiceFilter::new("Echo");
        let msg = query(MessageKind::StopDiscovery, &filter, &"mgr".into());
        assert_eq!(msg.meta(keys::TYPE), Some("stopDiscovery"));
        assert_eq!(filter_id(&msg), Some(filter.id()));
    }
}
