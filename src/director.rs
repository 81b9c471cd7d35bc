//! The director decides, per inbound call, which upstream connection
//! carries it and what metadata the outbound hop sends.
//!
//! It is a pure function over the registry and the inbound metadata so
//! every branch is testable with a synthetic metadata bag. Cancellation
//! propagation needs no work here: the outbound call object is owned by
//! the inbound call's task and is torn down with it.

use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Status;

use crate::registry::{routing_key, TaskRegistry};

/// Metadata keys a forwarded call must carry. Header names reach us
/// lower-cased by the HTTP/2 layer.
pub const TASK_ID_KEY: &str = "task_id";
pub const PARTY_ID_KEY: &str = "party_id";

/// A routing decision: the metadata for the outbound hop (a verbatim copy
/// of the inbound set, deadlines included since they travel as
/// `grpc-timeout`) and the upstream connection to carry the call.
#[derive(Debug)]
pub struct Route {
    pub key: String,
    pub metadata: MetadataMap,
    pub channel: Channel,
}

/// Maps one inbound call to its upstream.
///
/// A missing routing header is `NotFound`; an unreadable header value or a
/// key with no registration is `Unknown`. No upstream is contacted on
/// failure.
pub fn direct(registry: &TaskRegistry, metadata: &MetadataMap) -> Result<Route, Status> {
    let task_id = read_header(metadata, TASK_ID_KEY)?;
    let party_id = read_header(metadata, PARTY_ID_KEY)?;
    let key = routing_key(task_id, party_id);

    let task = registry
        .lookup(&key)
        .ok_or_else(|| Status::unknown(format!("no task registered for {key}")))?;

    Ok(Route {
        key,
        metadata: metadata.clone(),
        channel: task.channel,
    })
}

fn read_header<'a>(metadata: &'a MetadataMap, key: &str) -> Result<&'a str, Status> {
    let value = metadata
        .get(key)
        .ok_or_else(|| Status::not_found(format!("{key} not found in call metadata")))?;
    value
        .to_str()
        .map_err(|_| Status::unknown(format!("cannot read {key} from call metadata")))
}
