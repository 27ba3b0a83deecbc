pub mod error;
pub mod grpc;
pub mod protocol;
