use serde::{Deserialize, Serialize};

/// Control frames on the connect-server channel, tagged by `type`.
///
/// Anything that fails to parse as one of these is an opaque frame and is
/// left queued for the scenario driver untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectFrame {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "addInstance")]
    AddInstance {
        #[serde(rename = "instanceId")]
        instance_id: u32,
        tid: u32,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "destroyInstance")]
    DestroyInstance {
        #[serde(rename = "instanceId")]
        instance_id: u32,
    },
}

/// One element on an outbound queue: a request to serialize onto the wire, or
/// the end-of-connection sentinel that makes the sender pump close the socket
/// and exit. A dedicated variant means the sentinel can never collide with a
/// legitimate payload.
#[derive(Clone, Debug)]
pub enum Outbound {
    Request(serde_json::Value),
    Close,
}
