//! Binary wire protocol shared by the server and clients

mod codec;
mod message;

pub use codec::{decode_body, encode, encode_to_vec, FrameDecoder};
pub use message::{negotiate_version, tag, Message, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
