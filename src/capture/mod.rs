/// Interaction capture: transparent encryption of plaintext bodies
/// handed down by the proxy layer, plus the bounded async writer that
/// batches persistence off the request path.
pub mod encryptor;
pub mod writer;

pub use encryptor::{InteractionEncryptor, PlainInteraction};
pub use writer::CaptureWriter;
