//! MySQL client-side wire protocol
//!
//! Just enough of the protocol to authenticate, run one text query and read
//! its result set.

pub mod codec;
#[cfg(test)]
pub mod fake_server;
pub mod handshake;
pub mod packet;
pub mod resultset;

pub use codec::PacketCodec;
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, AuthSwitchRequest,
    ErrPacket, HandshakeResponse, InitialHandshake, NATIVE_PASSWORD_PLUGIN,
};
pub use packet::{capabilities, Command, Packet};
pub use resultset::{parse_column_count, ColumnDefinition, DecodeError, TextRow};
