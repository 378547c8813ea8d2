mod membership;
mod msg;

pub use membership::RoomMembership;
pub(crate) use msg::{fanout_targets, send_msg};
