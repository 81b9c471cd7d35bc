//! Wire messages for the built-in signup method.
//!
//! These structs are maintained by hand in the shape `prost-build` would
//! emit for the corresponding service definition, so the crate builds
//! without a protobuf compiler. The signup exchange is the only typed
//! traffic this process ever decodes; everything else moves through the
//! proxy as raw frames.

/// Fully qualified path of the one directly served method.
pub const SIGNUP_METHOD: &str = "/via.ViaService/Signup";

/// A worker announcing the (task, party) pair it serves and where it
/// listens.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignupRequest {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub party_id: String,
    #[prost(string, tag = "3")]
    pub service_type: String,
    /// host:port where the worker accepts forwarded calls.
    #[prost(string, tag = "4")]
    pub address: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Boolean {
    #[prost(bool, tag = "1")]
    pub result: bool,
}
