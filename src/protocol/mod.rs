//! Terminal command protocol.
//!
//! The vendor transport moves command/reply pairs over a socket; this module
//! owns what travels inside them.
//!
//! # Layout
//!
//! ```text
//! +-------------+     +-------------+     +------------------+
//! |   codec     |     |    auth     |     |     command      |
//! | (payloads)  |     | (challenge) |     | (codes, channel) |
//! +-------------+     +-------------+     +------------------+
//! ```

pub mod auth;
pub mod codec;
pub mod command;

pub use auth::{make_commkey, DEFAULT_TICKS};
pub use codec::{
    decode_attendance_table, decode_template_blocks, decode_time, decode_user_record,
    decode_user_table, encode_attendance_record, encode_table, encode_template_block,
    encode_time, encode_user_record, table_payload, TemplateBlock, TemplateCommit, MAX_TEMPLATE_BLOCK_SIZE, USER_RECORD_SIZE,
};
pub use command::{
    ChannelCapabilities, Command, CommandChannel, DataTable, RawCommand, Reply, REPLY_DATA,
    REPLY_ERROR, REPLY_OK, REPLY_UNAUTH,
};
