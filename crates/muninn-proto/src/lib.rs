//! Generated peer RPC types for the `muninn.v1` cache protocol.

pub mod v1 {
    tonic::include_proto!("muninn.v1");
}

/// Encoded file descriptor set, registered with the reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");
